use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::net::TcpStream;

use crate::pipe::tunnel::{
    protocol::{self, CorrelationId, Frame},
    splice,
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    /// Local service inbound connections are relayed to.
    pub local_addr: String,
    /// Public port to expose on the server.
    pub remote_port: u16,
    pub dial_timeout: Duration,
    pub buffer_size: usize,
}

pub struct Client {
    opts: Arc<ClientOptions>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_addr", &self.opts.server_addr)
            .field("remote_port", &self.opts.remote_port)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        opts.server_addr = opts.server_addr.trim().to_string();
        opts.local_addr = opts.local_addr.trim().to_string();
        if opts.server_addr.is_empty() {
            anyhow::bail!("tunnel: client server_addr is required");
        }
        if opts.local_addr.is_empty() {
            anyhow::bail!("tunnel: client local_addr is required");
        }
        if opts.dial_timeout <= Duration::from_millis(0) {
            opts.dial_timeout = Duration::from_secs(5);
        }
        Ok(Self {
            opts: Arc::new(opts),
        })
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => break,
                Err(err) => {
                    tracing::warn!(
                        server = %self.opts.server_addr,
                        remote_port = self.opts.remote_port,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "tunnel: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(Duration::from_secs(10));
        }

        self.cancel().await;
        Ok(())
    }

    async fn run_once(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut ctl = self.dial_server().await?;
        protocol::write_frame(
            &mut ctl,
            &Frame::Register {
                port: self.opts.remote_port.into(),
            },
        )
        .await
        .context("tunnel: send register")?;

        tracing::info!(
            server = %self.opts.server_addr,
            remote_port = self.opts.remote_port,
            local = %self.opts.local_addr,
            "tunnel: registered"
        );

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                frame = protocol::read_frame(&mut ctl) => {
                    match frame.context("tunnel: control channel")? {
                        Frame::Exchange { id } => {
                            let opts = self.opts.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_exchange(opts, id.clone()).await {
                                    tracing::debug!(cid = %id, err = %err, "tunnel: exchange ended");
                                }
                            });
                        }
                        other => {
                            anyhow::bail!("tunnel: unexpected {} frame on control channel", other.kind_name());
                        }
                    }
                }
            }
        }
    }

    async fn dial_server(&self) -> anyhow::Result<TcpStream> {
        let addr = self.opts.server_addr.as_str();
        tokio::time::timeout(self.opts.dial_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("tunnel: dial {addr} timed out"))?
            .with_context(|| format!("tunnel: dial {addr}"))
    }

    /// Best-effort teardown of the server-side forward on a fresh connection.
    async fn cancel(&self) {
        let res = async {
            let mut c = self.dial_server().await?;
            protocol::write_frame(
                &mut c,
                &Frame::Cancel {
                    port: self.opts.remote_port.into(),
                },
            )
            .await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        match res {
            Ok(()) => tracing::info!(remote_port = self.opts.remote_port, "tunnel: forward cancelled"),
            Err(err) => tracing::debug!(err = %err, "tunnel: cancel failed"),
        }
    }
}

async fn handle_exchange(opts: Arc<ClientOptions>, id: CorrelationId) -> anyhow::Result<()> {
    let local = tokio::time::timeout(opts.dial_timeout, TcpStream::connect(&opts.local_addr))
        .await
        .context("tunnel: dial local timed out")?
        .with_context(|| format!("tunnel: dial local {}", opts.local_addr))?;

    let mut data = tokio::time::timeout(opts.dial_timeout, TcpStream::connect(&opts.server_addr))
        .await
        .context("tunnel: dial server timed out")?
        .context("tunnel: dial server")?;
    protocol::write_frame(&mut data, &Frame::Exchange { id: id.clone() }).await?;

    let (traffic, res) = splice::splice(data, local, opts.buffer_size).await;
    tracing::debug!(cid = %id, a_to_b = traffic.a_to_b, b_to_a = traffic.b_to_a, "tunnel: exchange finished");
    res?;
    Ok(())
}
