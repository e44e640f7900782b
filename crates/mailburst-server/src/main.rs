//! Mailburst - bulk dispatch worker entry point
//!
//! Drives one job submission file through the engine, streaming progress
//! events to stdout as JSON lines and finishing with the terminal summary.

use anyhow::{Context, Result};
use mailburst_common::config::Config;
use mailburst_common::types::{EventKind, JobSubmission, TenantId, TransportConfig};
use mailburst_core::Engine;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

/// One job as submitted on disk: relay settings plus the message and list
#[derive(Debug, Deserialize)]
struct SubmissionFile {
    /// Owner of the job; generated when absent
    tenant_id: Option<TenantId>,
    transport: TransportConfig,
    #[serde(flatten)]
    job: JobSubmission,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = match Config::load() {
        Ok(config) => config,
        Err(_) => {
            info!("no configuration file found, using defaults");
            Config::default()
        }
    };

    let path = std::env::args()
        .nth(1)
        .context("usage: mailburst <job.json>")?;
    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read job file {}", path))?;
    let submission: SubmissionFile =
        serde_json::from_str(&raw).context("failed to parse job file")?;

    let engine = Engine::new(config.engine.clone());
    let mut events = engine.subscribe();

    let tenant_id = submission.tenant_id.unwrap_or_else(Uuid::new_v4);
    let job_id = engine
        .submit(tenant_id, submission.transport, submission.job)
        .await?;
    info!("job {} submitted for tenant {}", job_id, tenant_id);

    // Ctrl-C requests cancellation; the engine stops at the next
    // suspension-point boundary
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received, cancelling job {}", job_id);
                let _ = engine.cancel(job_id).await;
            }
        });
    }

    // Stream events until this job's terminal summary arrives
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!("event stream lagged, {} events dropped", missed);
                continue;
            }
            Err(RecvError::Closed) => anyhow::bail!("event stream closed before job finished"),
        };

        println!("{}", serde_json::to_string(&event)?);

        if event.job_id == job_id {
            if let EventKind::JobSummary { summary } = &event.event {
                info!(
                    "job {} finished as {} ({}/{} sent)",
                    job_id, summary.state, summary.success_count, summary.total
                );
                break;
            }
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mailburst=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
