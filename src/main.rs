use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use roomkeeper::briefing::{BriefingSink, LogSink, WebhookSink};
use roomkeeper::config::{AppConfig, StoreBackend};
use roomkeeper::engine::Engine;
use roomkeeper::notify::NotifyHub;
use roomkeeper::observability;
use roomkeeper::scheduler;
use roomkeeper::store::{InMemoryStore, NotionStore, RecordStore, RetryingStore};
use roomkeeper::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ROOMKEEPER_CONFIG").ok())
        .map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;

    observability::init_logging(&config.logging);
    observability::init_metrics(config.metrics.port)?;

    let store: Arc<dyn RecordStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(RetryingStore::new(InMemoryStore::new(), config.retry_policy())),
        StoreBackend::Notion => {
            let notion = NotionStore::new(config.notion_settings()?)?;
            Arc::new(RetryingStore::new(notion, config.retry_policy()))
        }
    };
    let rooms = config.rooms();
    let engine = Arc::new(Engine::new(
        store,
        rooms,
        config.booking_policy()?,
        Arc::new(NotifyHub::new()),
    ));

    if config.briefing.enabled {
        let sink: Arc<dyn BriefingSink> = match &config.briefing.webhook_url {
            Some(url) => Arc::new(WebhookSink::new(
                url.clone(),
                Duration::from_secs(config.briefing.timeout_secs),
            )?),
            None => Arc::new(LogSink),
        };
        tokio::spawn(scheduler::run_briefing_scheduler(
            engine.clone(),
            sink,
            config.briefing_time()?,
        ));
    }

    let max_connections = config.server.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("roomkeeper listening on {addr}");
    info!("  store: {:?}", config.store.backend);
    info!("  timezone: {}", engine.timezone());
    info!("  rooms: {}", engine.rooms().len());
    info!("  max duration: {}m", engine.policy().max_duration.num_minutes());
    info!("  max_connections: {max_connections}");
    info!(
        "  briefing: {}",
        if config.briefing.enabled { config.briefing.at.as_str() } else { "disabled" }
    );

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("could not register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, engine).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(config.server.drain_secs));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("roomkeeper stopped");
    Ok(())
}
