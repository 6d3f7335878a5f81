use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shiftbook::config::Config;
use shiftbook::dispatcher::{DispatchOptions, Dispatcher, LogSink};
use shiftbook::engine::{Engine, EngineConfig};
use shiftbook::store::MemoryStore;
use shiftbook::{compactor, observability};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(MemoryStore::open(&config.wal_path())?);

    let engine = Engine::start(store.clone(), EngineConfig::from(&config)).await?;
    let dispatcher = Dispatcher::start(
        engine.store(),
        Arc::new(LogSink),
        DispatchOptions {
            notify_local_writes: config.notify_local_writes,
        },
    );

    let today = chrono::Local::now().date_naive();
    let shifts = engine.shifts_for_date(&today).await?;
    info!("shiftbook running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  slots: {}", config.slots.join(" "));
    info!("  today: {today} ({} shifts)", shifts.len());
    info!("  capacity policy: {:?}", config.capacity_policy);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let cancel = CancellationToken::new();
    let compactor = tokio::spawn(compactor::run_compactor(
        store.clone(),
        config.compact_threshold,
        cancel.clone(),
    ));

    // Graceful shutdown on SIGTERM/ctrl-c
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
                    warn!("no SIGTERM handler: {e}");
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

    let mut view = engine.watch();
    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                let today_count = current.for_date(&today).len();
                info!(
                    revision = ?current.revision,
                    total = current.reservations.len(),
                    today = today_count,
                    "reservations changed"
                );
                if let Ok(over) = engine.capacity_violations(&today).await {
                    for load in over {
                        warn!(
                            time = %load.time,
                            booked = load.booked_seats,
                            max = load.max_reservations,
                            "shift over capacity"
                        );
                    }
                }
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    let stats = dispatcher.shutdown().await;
    info!(
        emitted = stats.emitted,
        failed = stats.failed,
        "notification dispatcher stopped"
    );
    engine.shutdown();
    cancel.cancel();
    compactor.await.ok();
    if let Err(e) = store.compact().await {
        warn!("final compaction failed: {e}");
    }

    info!("shiftbook stopped");
    Ok(())
}
