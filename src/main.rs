use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use roomy::reaper::{run_compactor, run_no_show_reaper};
use roomy::{Config, NotifyHub};

const COMPACT_CHECK_SECS: u64 = 30;

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    roomy::observability::init_tracing();

    let config = Config::load()?;
    roomy::observability::init(config.metrics_port)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(config.open_engine(notify.clone())?);

    info!("roomy engine ready");
    info!("  journal: {}", config.journal_path().display());
    info!("  timezone: {}", engine.time_zone());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let reaper = tokio::spawn(run_no_show_reaper(engine.clone(), config.reaper_interval()));
    let compactor = tokio::spawn(run_compactor(
        engine.clone(),
        config.compact_threshold,
        std::time::Duration::from_secs(COMPACT_CHECK_SECS),
    ));

    // Change feed to the log until a consumer embeds the engine.
    let mut feed = notify.subscribe_all();
    let audit = tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(n) => debug!(node = %n.node_id, payload = %n.payload, "change"),
                Err(RecvError::Lagged(skipped)) => warn!("change feed lagged, {skipped} notifications dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    shutdown_signal().await?;
    info!("shutdown signal received");

    reaper.abort();
    compactor.abort();
    audit.abort();

    match engine.compact_journal().await {
        Ok(events) => info!("journal compacted to {events} events"),
        Err(e) => warn!("final compaction failed: {e}"),
    }

    info!("roomy stopped");
    Ok(())
}
