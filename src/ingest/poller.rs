//! Interval scheduler driving the ingestion service.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ingest::model::CycleOutcome;
use crate::ingest::service::IngestionService;

/// Spawn a background task that runs a poll cycle on every interval tick.
///
/// Returns a `JoinHandle` and the service's shutdown token. Cancel the token
/// to abort the running cycle, close the session and stop polling.
pub fn spawn_ingest_poller(service: Arc<IngestionService>) -> (JoinHandle<()>, CancellationToken) {
    let shutdown = service.shutdown_token();
    let stop = shutdown.clone();
    let interval = service.config().poll.interval;

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            mailbox = %service.config().imap.mailbox,
            "Ingest poller started"
        );

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = tick.tick() => {}
            }

            let report = service.run_cycle().await;
            if let CycleOutcome::Skipped = report.outcome {
                debug!("Tick skipped, a cycle was already running");
            }
        }

        service.session().close().await;
        info!("Ingest poller shutting down");
    });

    (handle, shutdown)
}
