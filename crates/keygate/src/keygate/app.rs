use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::keygate::{
    config, http, identity, logging, notify, pool, proxy, telemetry, udp,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::locate_config(config_path)?;
    let created = config::seed_config_file(&resolved.path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _log_guard = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = resolved.source, "config: created new config file");
    }

    let store = Arc::new(
        identity::FileIdentityStore::open(&cfg.records_file)
            .with_context(|| format!("open records: {}", cfg.records_file.display()))?,
    );

    tracing::info!(
        config = %resolved.path.display(),
        listen = %cfg.listen,
        backend = %cfg.backend,
        base_domain = %cfg.base_domain,
        records = store.len(),
        "keygate: starting"
    );

    let gate = udp::UdpGate::new();
    let metrics: telemetry::SharedMetrics = Arc::new(telemetry::MetricsCollector::new());
    let sessions: telemetry::SharedSessions = Arc::new(telemetry::SessionRegistry::new());
    let notifier: notify::SharedNotifier = Arc::new(notify::LogNotifier);

    let shared_store: identity::SharedIdentityStore = store.clone();
    let resource_packs = Arc::new(http::ResourcePackProxy::new(
        cfg.backend.clone(),
        cfg.base_domain.clone(),
        shared_store.clone(),
        cfg.timeouts.http,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    // Records reload loop: new registrations become routable without a
    // restart.
    tasks.spawn(identity::watch_records(
        store.clone(),
        cfg.reload.enabled,
        cfg.reload.poll_interval,
        shutdown_rx.clone(),
    ));

    // Game/status/HTTP plane.
    let tcp_opts = Arc::new(proxy::TcpProxyOptions {
        listen_addr: cfg.listen.clone(),
        backend_addr: cfg.backend.clone(),
        base_domain: cfg.base_domain.clone(),
        store: shared_store,
        gate: gate.clone(),
        splice_pool: pool::BufferPool::new(proxy::SPLICE_BUFFER_BYTES),
        metrics: metrics.clone(),
        sessions: sessions.clone(),
        notifier,
        http: resource_packs,
        handshake_timeout: cfg.timeouts.handshake,
        dial_timeout: cfg.timeouts.dial,
    });
    tasks.spawn(proxy::serve_tcp(tcp_opts, shutdown_rx.clone()));

    // Voice/extension datagram plane on the same address.
    let udp_opts = udp::UdpProxyOptions {
        listen_addr: cfg.listen.clone(),
        backend_addr: cfg.backend.clone(),
        gate: gate.clone(),
        pool: pool::BufferPool::new(cfg.udp.buffer_size),
        metrics: metrics.clone(),
        queue_size: cfg.udp.queue_size,
        workers: cfg.udp.workers,
    };
    tasks.spawn(udp::serve_udp(udp_opts, shutdown_rx.clone()));

    // Wait for a shutdown signal or an unexpected task exit.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // In-flight splices end when their peers close; only bound the drain
    // so `docker stop` never stalls.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    let snap = metrics.snapshot();
    tracing::info!(
        connections = snap.total_connections_handled,
        bytes_in = snap.bytes_ingress,
        bytes_out = snap.bytes_egress,
        udp_forwarded = snap.udp_forwarded,
        udp_dropped = snap.udp_dropped,
        live_sessions = sessions.snapshot().len(),
        udp_sessions = gate.session_count(),
        "keygate: stopped"
    );

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
