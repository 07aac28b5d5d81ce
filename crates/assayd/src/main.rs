//! assayd: inference job daemon.
//!
//! Opens the job store and runs the retry-scheduling queue against the
//! inference service until Ctrl-C or a fatal queue error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use assay_core::config::AssayConfig;
use assay_core::JobState;
use assay_services::backend::InferenceClient;
use assay_services::{JobStore, QueueSettings, RetryQueue, SqliteJobStore};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = AssayConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = AssayConfig::load().context("failed to load config")?;
    tracing::info!(
        store = %config.store.path.display(),
        inference = %config.inference.base_url,
        workers = config.queue.max_workers,
        "assayd starting"
    );

    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::open(&config.store.path)
            .with_context(|| format!("failed to open job store {}", config.store.path.display()))?,
    );
    let client = InferenceClient::new(
        config.inference.base_url.clone(),
        Duration::from_secs(config.inference.request_timeout_secs),
    )
    .context("failed to build inference client")?;

    let queue = Arc::new(RetryQueue::new(
        store.clone(),
        Arc::new(client),
        QueueSettings::from_config(&config.queue),
    ));
    let queue_task = tokio::spawn(queue.run());

    let stats_printer = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            loop {
                interval.tick().await;
                let count = |state| store.list(Some(state)).map(|jobs| jobs.len());
                match (count(JobState::Queued), count(JobState::Running)) {
                    (Ok(queued), Ok(running)) => tracing::info!(queued, running, "queue status"),
                    (Err(e), _) | (_, Err(e)) => tracing::warn!(error = %e, "failed to read queue status"),
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
        r = queue_task => match r {
            Ok(Ok(())) => tracing::info!("retry queue exited"),
            Ok(Err(e)) => {
                stats_printer.abort();
                return Err(e).context("retry queue stopped");
            }
            Err(e) => tracing::error!(error = %e, "retry queue task panicked"),
        },
    }
    stats_printer.abort();

    Ok(())
}
