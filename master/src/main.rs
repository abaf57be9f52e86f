use std::{sync::Arc, time::Duration};

use anyhow::Context;
use common::{EngineConfig, FnRegistry};
use flow_master::{handlers, monitor, Session};
use tokio::net::TcpListener;
use tracing::info;
use worker::{pool::run_heartbeats, telemetry};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("master=debug,flow_master=debug,flow_worker=info,flow_common=info,tower_http=info,axum=info")
        .init();

    let mut config = EngineConfig::from_env();
    if !EngineConfig::memory_budget_from_env() {
        config.persist.memory_capacity = telemetry::memory_budget();
    }
    info!(
        "config: {} workers x {} slots, max_task_attempts={}, memoria persistible={} bytes",
        config.workers, config.worker_concurrency, config.max_task_attempts, config.persist.memory_capacity
    );

    let bind_addr = config.bind_addr.clone();
    let heartbeat_timeout = config.heartbeat_timeout;
    let session = Arc::new(Session::new(config, FnRegistry::with_builtins()));

    // heartbeats de los workers locales y monitor en segundo plano
    tokio::spawn(run_heartbeats(Arc::clone(session.pool()), HEARTBEAT_INTERVAL));
    tokio::spawn(monitor::monitor_workers(
        Arc::clone(session.pool()),
        heartbeat_timeout,
    ));

    // router HTTP
    let app = handlers::build_router(handlers::AppState::new(Arc::clone(&session)));

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {bind_addr}"))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    session.shutdown();
    Ok(())
}
