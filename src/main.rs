use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use mail_ingest::config::IngestConfig;
use mail_ingest::health::{HealthReporter, HealthStatus};
use mail_ingest::ingest::policy::{NoopClassifier, RuleSpamClassifier, SpamClassifier};
use mail_ingest::ingest::{IngestionService, spawn_ingest_poller};
use mail_ingest::mailbox::{ImapConnector, Session};
use mail_ingest::store::LibSqlStore;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Arc::new(IngestConfig::from_env().context("Invalid configuration")?);

    eprintln!("📬 mail-ingest v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Server: {}:{} (tls: {})",
        config.imap.host, config.imap.port, config.imap.tls
    );
    eprintln!("   Mailbox: {}", config.imap.mailbox);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Poll interval: {}s\n", config.poll.interval.as_secs());

    // ── Database ─────────────────────────────────────────────────────────
    let store = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Mailbox session ──────────────────────────────────────────────────
    let connector = Arc::new(ImapConnector::new(config.timeouts));
    let session = Arc::new(Session::new(&config, connector));

    let classifier: Arc<dyn SpamClassifier> = if config.policy.spam_filter {
        Arc::new(RuleSpamClassifier::default_rules())
    } else {
        Arc::new(NoopClassifier)
    };

    let service = Arc::new(IngestionService::new(
        Arc::clone(&config),
        Arc::clone(&session),
        store.clone(),
        store,
        classifier,
    ));

    // ── Health ───────────────────────────────────────────────────────────
    let health = HealthReporter::new(session, service.subscribe_history(), config.health);

    let (poller, shutdown) = spawn_ingest_poller(Arc::clone(&service));

    let health_shutdown = shutdown.clone();
    let health_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(HEALTH_LOG_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = health_shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }
            let sample = health.sample();
            match sample.status {
                HealthStatus::Up => info!(status = %sample.status, detail = %sample.detail, "Health"),
                _ => warn!(status = %sample.status, detail = %sample.detail, "Health"),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    shutdown.cancel();

    if let Err(e) = poller.await {
        warn!(error = %e, "Poller task ended abnormally");
    }
    if let Err(e) = health_task.await {
        warn!(error = %e, "Health task ended abnormally");
    }
    info!("Stopped");
    Ok(())
}
