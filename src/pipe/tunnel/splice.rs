use std::{
    io,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
};

use pin_project_lite::pin_project;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved by one splice. `a_to_b` is what `a` wrote and `b` received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Traffic {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

pin_project! {
    /// Counts bytes read from the inner stream, one atomic add per read call.
    struct Metered<'a, R> {
        #[pin]
        inner: R,
        count: &'a AtomicU64,
    }
}

impl<R: AsyncRead> AsyncRead for Metered<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let res = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            let n = buf.filled().len() - before;
            this.count.fetch_add(n as u64, Ordering::Relaxed);
        }
        res
    }
}

async fn pump<R, W>(rd: R, wr: &mut W, buffer_size: usize) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut rd = BufReader::with_capacity(buffer_size, rd);
    tokio::io::copy_buf(&mut rd, wr).await?;
    // Flush and signal end-of-stream before the splice tears both sides down.
    wr.shutdown().await
}

/// Copies bytes between `a` and `b` in both directions until either side reaches
/// end-of-stream or either direction fails, then closes both.
///
/// The returned counts are exact even when an error ended the splice; the error,
/// if any, is returned alongside them.
pub async fn splice<A, B>(a: A, b: B, buffer_size: usize) -> (Traffic, io::Result<()>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let buffer_size = if buffer_size == 0 {
        DEFAULT_BUFFER_SIZE
    } else {
        buffer_size
    };

    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    let (ar, mut aw) = tokio::io::split(a);
    let (br, mut bw) = tokio::io::split(b);

    // The first direction to finish ends the splice; the other one is dropped mid-copy.
    let res = {
        let up = pump(
            Metered {
                inner: ar,
                count: &a_to_b,
            },
            &mut bw,
            buffer_size,
        );
        let down = pump(
            Metered {
                inner: br,
                count: &b_to_a,
            },
            &mut aw,
            buffer_size,
        );

        tokio::select! {
            r = up => r,
            r = down => r,
        }
    };

    // Best-effort: both halves are dropped right after, which closes the sockets.
    let _ = aw.shutdown().await;
    let _ = bw.shutdown().await;

    let traffic = Traffic {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
    };
    (traffic, res)
}
