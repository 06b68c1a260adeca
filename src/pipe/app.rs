use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch, task::JoinSet};

use crate::pipe::{admin, config, logging, telemetry, tunnel};

pub async fn run_server(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    admin_port: Option<u16>,
) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path);
    let cfg = match &resolved {
        Some(r) => config::load_config(&r.path)
            .with_context(|| format!("load config: {}", r.path.display()))?,
        None => config::Config::default(),
    }
    .with_overrides(port, admin_port)?;

    let _logrt = logging::init(&cfg.logging)?;

    tracing::info!(
        config = ?resolved.as_ref().map(|r| r.path.display().to_string()),
        config_source = ?resolved.as_ref().map(|r| r.source.to_string()),
        port = cfg.port,
        admin_port = cfg.admin_port,
        bind_host = %cfg.bind_host,
        handshake_timeout = %humantime::format_duration(cfg.handshake_timeout),
        pending_timeout = %humantime::format_duration(cfg.pending_timeout),
        "pipe: starting server"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let traffic = Arc::new(telemetry::TrafficLog::default());

    let listen_addr = tunnel::protocol::target_for_port(cfg.port);
    let engine = Arc::new(tunnel::server::Engine::new(
        tunnel::server::ServerOptions {
            listen_addr: listen_addr.clone(),
            bind_host: cfg.bind_host.clone(),
            handshake_timeout: cfg.handshake_timeout,
            pending_timeout: cfg.pending_timeout,
            buffer_size: cfg.buffer_size,
        },
        traffic.clone(),
    ));

    // Without the main socket there is nothing to serve; fail before spawning anything.
    let ln = TcpListener::bind((Ipv4Addr::UNSPECIFIED, cfg.port))
        .await
        .with_context(|| format!("tunnel: bind {listen_addr}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    if cfg.admin_port != 0 {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.admin_port));

        let admin_state = admin::AdminState {
            prom: Some(prom.clone()),
            forwards: engine.forwards(),
            pending: engine.pending(),
            traffic: traffic.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    {
        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { engine.serve(ln, shutdown).await });
    }

    supervise(tasks, shutdown_tx).await
}

pub async fn run_client(opts: tunnel::client::ClientOptions) -> anyhow::Result<()> {
    let _logrt = logging::init(&config::LoggingConfig::default())?;

    tracing::info!(
        server = %opts.server_addr,
        local = %opts.local_addr,
        remote_port = opts.remote_port,
        "pipe: starting client"
    );

    let client = Arc::new(tunnel::client::Client::new(opts)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    tasks.spawn(async move { client.run(shutdown_rx).await });

    supervise(tasks, shutdown_tx).await
}

/// Waits for a shutdown signal or the first task to exit, then drains the rest.
async fn supervise(
    mut tasks: JoinSet<anyhow::Result<()>>,
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<()> {
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };

    // Hard cap so a stuck task cannot stall process exit.
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
