use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    io::AsyncWrite,
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
};

use crate::pipe::{
    telemetry::{self, TrafficLog, TrafficRecord},
    tunnel::{
        forwards::{ForwardHandle, ForwardRegistry},
        pending::PendingConns,
        protocol::{self, CorrelationId, Frame, ProtocolError, WirePort},
        splice,
    },
};

const NOTIFY_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    /// Host public listeners bind on.
    pub bind_host: String,
    /// Deadline for the first frame of a new connection and for control-channel writes.
    pub handshake_timeout: Duration,
    /// Unclaimed inbound connections are closed after this long. Zero disables expiry.
    pub pending_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: ":8910".into(),
            bind_host: "0.0.0.0".into(),
            handshake_timeout: Duration::from_secs(3),
            pending_timeout: Duration::from_secs(30),
            buffer_size: splice::DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("invalid port: {0}")]
    InvalidPort(WirePort),
    #[error("bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Tunnel engine: classifies every connection on the main listener by its first
/// frame and runs the register, exchange and cancel flows.
pub struct Engine {
    opts: ServerOptions,
    forwards: Arc<ForwardRegistry>,
    pending: Arc<PendingConns>,
    traffic: Arc<TrafficLog>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("listen_addr", &self.opts.listen_addr)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(opts: ServerOptions, traffic: Arc<TrafficLog>) -> Self {
        Self {
            opts,
            forwards: Arc::new(ForwardRegistry::new()),
            pending: Arc::new(PendingConns::new()),
            traffic,
        }
    }

    pub fn forwards(&self) -> Arc<ForwardRegistry> {
        self.forwards.clone()
    }

    pub fn pending(&self) -> Arc<PendingConns> {
        self.pending.clone()
    }

    pub fn traffic(&self) -> Arc<TrafficLog> {
        self.traffic.clone()
    }

    pub async fn serve(
        self: Arc<Self>,
        ln: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(
            addr = %self.opts.listen_addr,
            local = ?ln.local_addr().ok(),
            "tunnel: listening"
        );

        if self.opts.pending_timeout > Duration::ZERO {
            let pending = self.pending.clone();
            let ttl = self.opts.pending_timeout;
            let shutdown = shutdown.clone();
            tokio::spawn(async move { sweep_loop(pending, ttl, shutdown).await });
        }

        let res = loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                res = ln.accept() => {
                    let (conn, peer) = match res {
                        Ok(v) => v,
                        Err(err) => break Err(anyhow::Error::new(err).context("tunnel: accept")),
                    };
                    let engine = self.clone();
                    tokio::spawn(async move {
                        if tracing::enabled!(tracing::Level::DEBUG) {
                            tracing::debug!(peer = %peer, "tunnel: accepted");
                        }
                        engine.handle_conn(conn, peer).await;
                    });
                }
            }
        };

        self.forwards.close_all();
        res
    }

    async fn handle_conn(&self, mut conn: TcpStream, peer: SocketAddr) {
        let first = tokio::time::timeout(self.opts.handshake_timeout, protocol::read_frame(&mut conn)).await;
        let frame = match first {
            Ok(Ok(f)) => f,
            Ok(Err(err)) => {
                tracing::warn!(peer = %peer, err = %err, "tunnel: unreadable first frame");
                return;
            }
            Err(_) => {
                tracing::debug!(peer = %peer, "tunnel: first frame timed out");
                return;
            }
        };

        match frame {
            Frame::Register { port } => {
                if let Err(err) = self.handle_register(conn, peer, port).await {
                    tracing::warn!(peer = %peer, err = %err, "tunnel: register rejected");
                }
            }
            Frame::Exchange { id } => self.handle_exchange(conn, peer, id).await,
            Frame::Cancel { port } => self.handle_cancel(port),
        }
    }

    async fn handle_register(
        &self,
        conn: TcpStream,
        peer: SocketAddr,
        port: WirePort,
    ) -> Result<(), RegisterError> {
        let port = protocol::validate_port(port).ok_or(RegisterError::InvalidPort(port))?;
        let ln = TcpListener::bind((self.opts.bind_host.as_str(), port))
            .await
            .map_err(|source| RegisterError::Bind { port, source })?;

        let bound = ln.local_addr().map(|a| a.port()).unwrap_or(port);
        let handle = self
            .forwards
            .add(peer.to_string(), protocol::target_for_port(bound));

        tracing::info!(origin = %peer, forward = %handle.target, "tunnel: forward registered");
        self.run_forward(conn, ln, handle).await;
        Ok(())
    }

    /// Accept loop for one forward. Runs until the forward is cancelled, the control
    /// channel fails, or the public listener errors.
    async fn run_forward(&self, conn: TcpStream, ln: TcpListener, handle: ForwardHandle) {
        let ForwardHandle {
            id,
            target,
            mut stop,
        } = handle;
        let (mut ctl_rd, ctl_wr) = conn.into_split();

        // Frame reads are not cancel-safe, so the control read half gets its own task.
        let (frames_tx, mut frames_rx) = mpsc::channel::<Result<Frame, ProtocolError>>(4);
        let reader = tokio::spawn(async move {
            loop {
                let res = protocol::read_frame(&mut ctl_rd).await;
                let failed = res.is_err();
                if frames_tx.send(res).await.is_err() || failed {
                    break;
                }
            }
        });

        // Exchange frames are written by their own task; accepts only enqueue ids.
        let (notify_tx, notify_rx) = mpsc::channel::<CorrelationId>(NOTIFY_QUEUE);
        let mut writer = tokio::spawn(write_exchanges(
            ctl_wr,
            notify_rx,
            self.pending.clone(),
            self.opts.handshake_timeout,
        ));

        let reason = loop {
            tokio::select! {
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        break "cancelled";
                    }
                }
                frame = frames_rx.recv() => match frame {
                    Some(Ok(Frame::Cancel { port })) => self.handle_cancel(port),
                    Some(Ok(other)) => {
                        tracing::warn!(forward = %target, kind = other.kind_name(), "tunnel: unexpected frame on control channel");
                        break "protocol error";
                    }
                    Some(Err(err)) => {
                        tracing::debug!(forward = %target, err = %err, "tunnel: control channel read ended");
                        break "control channel closed";
                    }
                    None => break "control channel closed",
                },
                res = &mut writer => {
                    match res {
                        Ok(Err(err)) => tracing::warn!(forward = %target, err = %err, "tunnel: exchange notify failed"),
                        Ok(Ok(())) => {}
                        Err(err) => tracing::warn!(forward = %target, err = %err, "tunnel: notify task failed"),
                    }
                    break "control channel write failed";
                }
                res = ln.accept() => {
                    let (inbound, user) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(forward = %target, err = %err, "tunnel: public accept failed");
                            break "accept failed";
                        }
                    };
                    let cid = self.park(inbound);
                    match notify_tx.try_send(cid) {
                        Ok(()) => {
                            tracing::debug!(forward = %target, user = %user, "tunnel: inbound connection queued");
                        }
                        Err(mpsc::error::TrySendError::Full(cid)) => {
                            self.pending.remove(&cid);
                            tracing::warn!(forward = %target, user = %user, "tunnel: notify queue full; dropping inbound connection");
                        }
                        Err(mpsc::error::TrySendError::Closed(cid)) => {
                            self.pending.remove(&cid);
                            break "control channel write failed";
                        }
                    }
                }
            }
        };

        reader.abort();
        writer.abort();
        drop(ln);
        self.forwards.remove_by_id(id);
        tracing::info!(forward = %target, reason, "tunnel: forward closed");
    }

    /// Stores an inbound connection under a fresh correlation id.
    fn park(&self, inbound: TcpStream) -> CorrelationId {
        let mut inbound = inbound;
        loop {
            let id = CorrelationId::random();
            match self.pending.put(id.clone(), inbound) {
                Ok(()) => return id,
                Err(back) => inbound = back,
            }
        }
    }

    async fn handle_exchange(&self, conn: TcpStream, peer: SocketAddr, id: CorrelationId) {
        let Some(inbound) = self.pending.take(&id) else {
            tracing::debug!(peer = %peer, cid = %id, "tunnel: unknown correlation id; closing");
            return;
        };

        let target = inbound
            .local_addr()
            .map(|a| protocol::target_for_port(a.port()))
            .unwrap_or_default();
        tracing::debug!(peer = %peer, cid = %id, forward = %target, "tunnel: splicing");

        let (traffic, res) = splice::splice(inbound, conn, self.opts.buffer_size).await;
        if let Err(err) = res {
            tracing::debug!(cid = %id, err = %err, "tunnel: splice ended with error");
        }

        tracing::debug!(
            cid = %id,
            forward = %target,
            a_to_b = traffic.a_to_b,
            b_to_a = traffic.b_to_a,
            "tunnel: splice finished"
        );
        self.traffic.record(TrafficRecord {
            cid: id.to_string(),
            target,
            traffic,
            finished_at_unix_ms: telemetry::now_unix_ms(),
        });
    }

    fn handle_cancel(&self, port: WirePort) {
        let Some(port) = protocol::validate_port(port) else {
            tracing::warn!(port, "tunnel: cancel for invalid port");
            return;
        };
        let target = protocol::target_for_port(port);
        if self.forwards.remove_by_target(&target) {
            tracing::info!(forward = %target, "tunnel: forward cancelled");
        } else {
            tracing::debug!(forward = %target, "tunnel: cancel for unknown forward");
        }
    }
}

/// Writes one Exchange frame per queued id. The first failed or timed-out write drops
/// that id's pending connection and ends the task.
async fn write_exchanges<W>(
    mut ctl: W,
    mut ids: mpsc::Receiver<CorrelationId>,
    pending: Arc<PendingConns>,
    write_timeout: Duration,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(id) = ids.recv().await {
        let frame = Frame::Exchange { id: id.clone() };
        let err = match tokio::time::timeout(write_timeout, protocol::write_frame(&mut ctl, &frame)).await {
            Ok(Ok(())) => {
                metrics::counter!("pipe_exchanges_total").increment(1);
                tracing::debug!(cid = %id, "tunnel: exchange notified");
                continue;
            }
            Ok(Err(err)) => err,
            Err(_) => ProtocolError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "control channel write timed out",
            )),
        };

        pending.remove(&id);
        ids.close();
        while let Ok(queued) = ids.try_recv() {
            pending.remove(&queued);
        }
        return Err(err);
    }
    Ok(())
}

async fn sweep_loop(pending: Arc<PendingConns>, ttl: Duration, mut shutdown: watch::Receiver<bool>) {
    let period = (ttl / 2).max(Duration::from_millis(100));
    let mut tick = tokio::time::interval(period);

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                let n = pending.sweep_expired(ttl);
                if n > 0 {
                    tracing::info!(expired = n, "tunnel: closed unclaimed inbound connections");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    struct Harness {
        engine: Arc<Engine>,
        addr: SocketAddr,
        _shutdown: watch::Sender<bool>,
    }

    async fn start(opts: ServerOptions) -> Harness {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let engine = Arc::new(Engine::new(
            ServerOptions {
                bind_host: "127.0.0.1".into(),
                ..opts
            },
            Arc::new(TrafficLog::default()),
        ));
        let (tx, rx) = watch::channel(false);
        let e = engine.clone();
        tokio::spawn(async move { e.serve(ln, rx).await });
        Harness {
            engine,
            addr,
            _shutdown: tx,
        }
    }

    async fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if cond() {
                return true;
            }
            if tokio::time::Instant::now() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn send(addr: SocketAddr, frame: Frame) -> TcpStream {
        let mut c = TcpStream::connect(addr).await.unwrap();
        protocol::write_frame(&mut c, &frame).await.unwrap();
        c
    }

    /// Registers an ephemeral public port and returns the control channel plus that port.
    async fn register(h: &Harness) -> (TcpStream, u16) {
        let before = h.engine.forwards().len();
        let ctl = send(h.addr, Frame::Register { port: 0 }).await;
        let forwards = h.engine.forwards();
        assert!(wait_until(|| forwards.len() > before).await);
        let snap = forwards.snapshot();
        let target = &snap.last().unwrap().target;
        let port = target.trim_start_matches(':').parse().unwrap();
        (ctl, port)
    }

    async fn next_exchange(ctl: &mut TcpStream) -> CorrelationId {
        let frame = tokio::time::timeout(Duration::from_secs(2), protocol::read_frame(ctl))
            .await
            .unwrap()
            .unwrap();
        match frame {
            Frame::Exchange { id } => id,
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    async fn read_eof(c: &mut TcpStream) -> bool {
        let mut buf = [0u8; 16];
        match tokio::time::timeout(Duration::from_secs(2), c.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => true,
            _ => false,
        }
    }

    #[tokio::test]
    async fn relays_bytes_end_to_end_and_records_traffic() {
        let h = start(ServerOptions::default()).await;
        let (mut ctl, port) = register(&h).await;

        let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        user.write_all(b"hello").await.unwrap();

        let id = next_exchange(&mut ctl).await;
        let mut data = send(h.addr, Frame::Exchange { id }).await;

        let mut buf = [0u8; 5];
        data.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        data.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        drop(user);
        drop(data);

        let traffic = h.engine.traffic();
        assert!(wait_until(|| traffic.totals().splices == 1).await);
        let rec = &traffic.recent()[0];
        assert_eq!(rec.traffic.a_to_b, 5);
        assert_eq!(rec.traffic.b_to_a, 6);
        assert_eq!(rec.target, format!(":{port}"));
        assert!(h.engine.pending().is_empty());
    }

    #[tokio::test]
    async fn simultaneous_inbound_connections_get_distinct_ids_without_crosstalk() {
        let h = start(ServerOptions::default()).await;
        let (mut ctl, port) = register(&h).await;

        let mut u1 = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut u2 = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let id1 = next_exchange(&mut ctl).await;
        let id2 = next_exchange(&mut ctl).await;
        assert_ne!(id1, id2);

        let mut d1 = send(h.addr, Frame::Exchange { id: id1 }).await;
        let mut d2 = send(h.addr, Frame::Exchange { id: id2 }).await;

        u1.write_all(b"one").await.unwrap();
        u2.write_all(b"two").await.unwrap();

        // Each data connection echoes what it got; every user must see only its own bytes.
        for d in [&mut d1, &mut d2] {
            let mut buf = [0u8; 3];
            d.read_exact(&mut buf).await.unwrap();
            d.write_all(&buf).await.unwrap();
        }

        let mut buf = [0u8; 3];
        u1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");
        u2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
    }

    #[tokio::test]
    async fn correlation_id_is_claimed_at_most_once() {
        let h = start(ServerOptions::default()).await;
        let (mut ctl, port) = register(&h).await;

        let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let id = next_exchange(&mut ctl).await;

        let mut c1 = send(h.addr, Frame::Exchange { id: id.clone() }).await;
        let mut c2 = send(h.addr, Frame::Exchange { id }).await;
        let pending = h.engine.pending();
        assert!(wait_until(|| pending.is_empty()).await);

        user.write_all(b"ping").await.unwrap();

        let mut got = 0;
        let mut closed = 0;
        for c in [&mut c1, &mut c2] {
            let mut buf = [0u8; 4];
            match tokio::time::timeout(Duration::from_secs(2), c.read(&mut buf)).await {
                Ok(Ok(4)) => {
                    assert_eq!(&buf, b"ping");
                    got += 1;
                }
                Ok(Ok(0)) | Ok(Err(_)) => closed += 1,
                other => panic!("unexpected read result: {other:?}"),
            }
        }
        assert_eq!((got, closed), (1, 1));
    }

    #[tokio::test]
    async fn unknown_id_closes_claimer_and_leaves_store_untouched() {
        let h = start(ServerOptions::default()).await;
        let (mut ctl, port) = register(&h).await;
        let _user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _ = next_exchange(&mut ctl).await;
        assert_eq!(h.engine.pending().len(), 1);

        let mut stray = send(
            h.addr,
            Frame::Exchange {
                id: CorrelationId::random(),
            },
        )
        .await;
        assert!(read_eof(&mut stray).await);
        assert_eq!(h.engine.pending().len(), 1);
    }

    #[tokio::test]
    async fn cancel_for_unknown_target_is_noop() {
        let h = start(ServerOptions::default()).await;
        let (_ctl, port) = register(&h).await;
        let before = h.engine.forwards().snapshot();

        let other = if port == 1 { 2 } else { 1 };
        let _c = send(h.addr, Frame::Cancel { port: other }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let after = h.engine.forwards().snapshot();
        assert_eq!(after.len(), before.len());
        assert_eq!(after[0].id, before[0].id);
    }

    #[tokio::test]
    async fn cancel_closes_public_listener_and_control_channel() {
        let h = start(ServerOptions::default()).await;
        let (mut ctl, port) = register(&h).await;

        let _c = send(h.addr, Frame::Cancel { port: port as u32 }).await;
        let forwards = h.engine.forwards();
        assert!(wait_until(|| forwards.is_empty()).await);
        assert!(read_eof(&mut ctl).await);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "listener still open");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn cancel_on_control_channel_tears_down_own_forward() {
        let h = start(ServerOptions::default()).await;
        let (mut ctl, port) = register(&h).await;

        protocol::write_frame(&mut ctl, &Frame::Cancel { port: port as u32 })
            .await
            .unwrap();
        let forwards = h.engine.forwards();
        assert!(wait_until(|| forwards.is_empty()).await);
    }

    #[tokio::test]
    async fn invalid_port_is_rejected() {
        let h = start(ServerOptions::default()).await;
        let mut c = send(h.addr, Frame::Register { port: 65536 }).await;
        assert!(read_eof(&mut c).await);
        assert!(h.engine.forwards().is_empty());
    }

    #[tokio::test]
    async fn port_in_use_is_rejected() {
        let h = start(ServerOptions::default()).await;
        let busy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = busy.local_addr().unwrap().port();

        let mut c = send(h.addr, Frame::Register { port: port as u32 }).await;
        assert!(read_eof(&mut c).await);
        assert!(h.engine.forwards().is_empty());
    }

    #[tokio::test]
    async fn control_channel_loss_tears_down_forward() {
        let h = start(ServerOptions::default()).await;
        let (ctl, port) = register(&h).await;
        drop(ctl);

        let forwards = h.engine.forwards();
        assert!(wait_until(|| forwards.is_empty()).await);

        // The port is free again for a new registration.
        let ln = TcpListener::bind(("127.0.0.1", port)).await;
        assert!(ln.is_ok());
    }

    #[tokio::test]
    async fn unclaimed_inbound_connection_expires() {
        let h = start(ServerOptions {
            pending_timeout: Duration::from_millis(150),
            ..ServerOptions::default()
        })
        .await;
        let (mut ctl, port) = register(&h).await;

        let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let id = next_exchange(&mut ctl).await;

        let pending = h.engine.pending();
        assert!(wait_until(|| pending.is_empty()).await);
        assert!(read_eof(&mut user).await);

        // A late claim finds nothing.
        let mut late = send(h.addr, Frame::Exchange { id }).await;
        assert!(read_eof(&mut late).await);
    }

    #[tokio::test]
    async fn failed_exchange_write_drops_pending_connections() {
        let pending = Arc::new(PendingConns::new());
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        let mut users = Vec::new();
        let (tx, rx) = mpsc::channel(4);
        for _ in 0..2 {
            users.push(TcpStream::connect(addr).await.unwrap());
            let (inbound, _) = ln.accept().await.unwrap();
            let id = CorrelationId::random();
            pending.put(id.clone(), inbound).unwrap();
            tx.send(id).await.unwrap();
        }

        // The peer never reads and the pipe is smaller than one frame.
        let (ctl, _peer) = tokio::io::duplex(8);
        let res = write_exchanges(ctl, rx, pending.clone(), Duration::from_millis(100)).await;
        match res {
            Err(ProtocolError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected result: {other:?}"),
        }

        assert!(pending.is_empty());
        for user in &mut users {
            assert!(read_eof(user).await);
        }
        assert!(tx.send(CorrelationId::random()).await.is_err());
    }

    #[tokio::test]
    async fn silent_connection_is_dropped_after_handshake_timeout() {
        let h = start(ServerOptions {
            handshake_timeout: Duration::from_millis(100),
            ..ServerOptions::default()
        })
        .await;

        let mut c = TcpStream::connect(h.addr).await.unwrap();
        assert!(read_eof(&mut c).await);
    }
}
