use std::fmt;

use bytes::{BufMut, BytesMut};
use rand::{Rng, distr::Alphanumeric, rng};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const KIND_REGISTER: u8 = 1;
const KIND_EXCHANGE: u8 = 2;
const KIND_CANCEL: u8 = 3;
const PROTOCOL_V1: u8 = 1;

/// kind(1) + version(1) + len(4)
const HEADER_LEN: usize = 6;

pub const MAX_FRAME_PAYLOAD: u32 = 1024;
pub const CORRELATION_ID_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),
    #[error("unsupported version: {0}")]
    BadVersion(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("malformed {kind} payload")]
    Malformed { kind: &'static str },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque token pairing one inbound user connection with the data connection that claims it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn random() -> Self {
        let s: String = rng()
            .sample_iter(&Alphanumeric)
            .take(CORRELATION_ID_LEN)
            .map(char::from)
            .collect();
        Self(s)
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != CORRELATION_ID_LEN || !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Port as carried on the wire. Wider than `u16` so out-of-range requests are
/// representable and can be rejected by the server instead of silently truncated.
pub type WirePort = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Turn this connection into the control channel for a forward on `port`.
    Register { port: WirePort },
    /// Server -> client on the control channel: an inbound connection waits under `id`.
    /// Client -> server on a fresh connection: claim the inbound connection for `id`.
    Exchange { id: CorrelationId },
    /// Tear down the forward bound to `port`.
    Cancel { port: WirePort },
}

impl Frame {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "register",
            Frame::Exchange { .. } => "exchange",
            Frame::Cancel { .. } => "cancel",
        }
    }

    fn encode(&self) -> BytesMut {
        let (kind, payload_len) = match self {
            Frame::Register { .. } => (KIND_REGISTER, 4),
            Frame::Exchange { id } => (KIND_EXCHANGE, id.as_str().len()),
            Frame::Cancel { .. } => (KIND_CANCEL, 4),
        };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        buf.put_u8(kind);
        buf.put_u8(PROTOCOL_V1);
        buf.put_u32(payload_len as u32);
        match self {
            Frame::Register { port } | Frame::Cancel { port } => buf.put_u32(*port),
            Frame::Exchange { id } => buf.put_slice(id.as_str().as_bytes()),
        }
        buf
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<(), ProtocolError> {
    let buf = frame.encode();
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, ProtocolError> {
    let kind = r.read_u8().await?;
    if !matches!(kind, KIND_REGISTER | KIND_EXCHANGE | KIND_CANCEL) {
        return Err(ProtocolError::UnknownKind(kind));
    }

    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }

    let n = r.read_u32().await?;
    if n > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(n));
    }

    let mut payload = vec![0u8; n as usize];
    r.read_exact(&mut payload).await?;

    match kind {
        KIND_REGISTER => Ok(Frame::Register {
            port: decode_port(&payload, "register")?,
        }),
        KIND_CANCEL => Ok(Frame::Cancel {
            port: decode_port(&payload, "cancel")?,
        }),
        _ => {
            let id = std::str::from_utf8(&payload)
                .ok()
                .and_then(CorrelationId::parse)
                .ok_or(ProtocolError::Malformed { kind: "exchange" })?;
            Ok(Frame::Exchange { id })
        }
    }
}

fn decode_port(payload: &[u8], kind: &'static str) -> Result<WirePort, ProtocolError> {
    let b: [u8; 4] = payload
        .try_into()
        .map_err(|_| ProtocolError::Malformed { kind })?;
    Ok(u32::from_be_bytes(b))
}

/// Returns the port if it fits a TCP port number.
pub fn validate_port(port: WirePort) -> Option<u16> {
    u16::try_from(port).ok()
}

/// Target address key a forward is registered and cancelled under.
pub fn target_for_port(port: u16) -> String {
    format!(":{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_roundtrip_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let id = CorrelationId::random();
        let sent = vec![
            Frame::Register { port: 9000 },
            Frame::Exchange { id: id.clone() },
            Frame::Cancel { port: 9000 },
        ];

        let frames = sent.clone();
        let w = tokio::spawn(async move {
            for f in &frames {
                write_frame(&mut a, f).await.unwrap();
            }
        });

        for want in &sent {
            let got = read_frame(&mut b).await.unwrap();
            assert_eq!(&got, want);
        }
        w.await.unwrap();
    }

    #[tokio::test]
    async fn register_keeps_out_of_range_port_for_validation() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &Frame::Register { port: 70000 })
            .await
            .unwrap();

        let got = read_frame(&mut b).await.unwrap();
        assert_eq!(got, Frame::Register { port: 70000 });
        assert_eq!(validate_port(70000), None);
        assert_eq!(validate_port(65535), Some(65535));
        assert_eq!(validate_port(0), Some(0));
    }

    #[tokio::test]
    async fn rejects_too_large_length_without_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_u8(KIND_EXCHANGE).await.unwrap();
            a.write_u8(PROTOCOL_V1).await.unwrap();
            a.write_u32(MAX_FRAME_PAYLOAD + 1).await.unwrap();
        });

        match read_frame(&mut b).await.unwrap_err() {
            ProtocolError::PayloadTooLarge(n) => assert!(n > MAX_FRAME_PAYLOAD),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_unknown_kind_and_version() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[9, PROTOCOL_V1, 0, 0, 0, 0]).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(ProtocolError::UnknownKind(9))
        ));

        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[KIND_CANCEL, 2, 0, 0, 0, 4, 0, 0, 0, 1])
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(ProtocolError::BadVersion(2))
        ));
    }

    #[tokio::test]
    async fn rejects_malformed_exchange_id() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut raw = vec![KIND_EXCHANGE, PROTOCOL_V1, 0, 0, 0, 5];
        raw.extend_from_slice(b"short");
        a.write_all(&raw).await.unwrap();

        assert!(matches!(
            read_frame(&mut b).await,
            Err(ProtocolError::Malformed { kind: "exchange" })
        ));
    }

    #[test]
    fn random_ids_are_well_formed_and_distinct() {
        let a = CorrelationId::random();
        let b = CorrelationId::random();
        assert_ne!(a, b);
        assert!(CorrelationId::parse(a.as_str()).is_some());
        assert!(CorrelationId::parse("not-alnum-value!").is_none());
    }
}
