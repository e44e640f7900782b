//! Job coordination - lifecycle, aggregation, terminal summary

mod cancel;

pub use cancel::CancelToken;

use crate::batch::{BatchProcessor, BatchRunOutcome};
use crate::events::EventBus;
use chrono::{DateTime, Utc};
use mailburst_common::types::{
    EventKind, JobId, JobState, JobStatus, JobSummary, MessagePayload, ProgressEvent, TenantId,
    TransportConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Live aggregate counters for a running job. Written only by the job's
/// owning worker; read by status snapshots.
#[derive(Debug, Default)]
pub struct JobCounters {
    success: AtomicUsize,
    failed: AtomicUsize,
}

impl JobCounters {
    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successes(&self) -> usize {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> usize {
        self.successes() + self.failures()
    }
}

/// Owns one job for its lifetime: queued through terminal. The terminal
/// state is computed exactly once, from final counters, never inferred
/// mid-run. External status queries get cloned snapshots.
pub struct JobCoordinator {
    job_id: JobId,
    tenant_id: TenantId,
    transport: TransportConfig,
    payload: MessagePayload,
    recipients: Vec<String>,
    created_at: DateTime<Utc>,
    state: RwLock<LifecycleState>,
    counters: JobCounters,
    summary: RwLock<Option<JobSummary>>,
    cancel: CancelToken,
    events: EventBus,
}

#[derive(Debug, Clone, Copy)]
struct LifecycleState {
    state: JobState,
    completed_at: Option<DateTime<Utc>>,
}

impl JobCoordinator {
    pub fn new(
        tenant_id: TenantId,
        transport: TransportConfig,
        payload: MessagePayload,
        recipients: Vec<String>,
        events: EventBus,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            tenant_id,
            transport,
            payload,
            recipients,
            created_at: Utc::now(),
            state: RwLock::new(LifecycleState {
                state: JobState::Queued,
                completed_at: None,
            }),
            counters: JobCounters::default(),
            summary: RwLock::new(None),
            cancel: CancelToken::new(),
            events,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn transport_config(&self) -> &TransportConfig {
        &self.transport
    }

    pub fn total_recipients(&self) -> usize {
        self.recipients.len()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Point-in-time snapshot for external status queries.
    pub async fn status(&self) -> JobStatus {
        let lifecycle = *self.state.read().await;
        JobStatus {
            job_id: self.job_id,
            tenant_id: self.tenant_id,
            state: lifecycle.state,
            total: self.recipients.len(),
            processed: self.counters.processed(),
            success_count: self.counters.successes(),
            failed_count: self.counters.failures(),
            created_at: self.created_at,
            completed_at: lifecycle.completed_at,
        }
    }

    /// Terminal summary, present once the job has finished.
    pub async fn summary(&self) -> Option<JobSummary> {
        self.summary.read().await.clone()
    }

    /// Drive the job to a terminal state. Called exactly once, by the
    /// worker that owns the job.
    pub async fn run(&self, processor: &BatchProcessor) -> JobSummary {
        if self.cancel.is_cancelled() {
            info!("job {} cancelled before it started", self.job_id);
            return self.finalize(JobState::Cancelled, &[]).await;
        }

        {
            let mut lifecycle = self.state.write().await;
            lifecycle.state = JobState::Running;
        }
        info!(
            "job {} running for tenant {}: {} recipients",
            self.job_id,
            self.tenant_id,
            self.recipients.len()
        );

        let outcome = processor
            .process(&self.recipients, &self.payload, &self.cancel, &self.counters)
            .await;

        if let Some(reason) = &outcome.aborted {
            warn!(
                "job {} stopped early, relay unavailable: {}",
                self.job_id, reason
            );
        }

        let state = Self::terminal_state(&outcome, self.recipients.len());
        let failed_recipients: Vec<String> = outcome
            .results
            .iter()
            .filter(|r| !r.outcome.is_sent())
            .map(|r| r.recipient.clone())
            .collect();
        self.finalize(state, &failed_recipients).await
    }

    /// The job never got to process anything (e.g. the transport could not
    /// even be constructed).
    pub async fn fail_without_processing(&self, reason: &str) -> JobSummary {
        warn!("job {} failed before processing: {}", self.job_id, reason);
        self.finalize(JobState::Failed, &[]).await
    }

    /// Terminal state from final aggregates, per the lifecycle contract.
    fn terminal_state(outcome: &BatchRunOutcome, total: usize) -> JobState {
        if outcome.cancelled {
            return JobState::Cancelled;
        }
        if outcome.aborted.is_some() {
            return if outcome.success_count > 0 {
                JobState::PartialFailure
            } else {
                JobState::Failed
            };
        }
        // All recipients processed from here on
        if total == 0 || outcome.failed_count == 0 {
            JobState::Completed
        } else if outcome.success_count == 0 {
            JobState::Failed
        } else {
            JobState::PartialFailure
        }
    }

    async fn finalize(&self, state: JobState, failed_recipients: &[String]) -> JobSummary {
        let completed_at = Utc::now();
        {
            let mut lifecycle = self.state.write().await;
            lifecycle.state = state;
            lifecycle.completed_at = Some(completed_at);
        }

        let processed = self.counters.processed();
        let success_count = self.counters.successes();
        let failed_count = self.counters.failures();
        let success_rate = if processed > 0 {
            success_count as f64 / processed as f64
        } else {
            0.0
        };

        let summary = JobSummary {
            job_id: self.job_id,
            state,
            total: self.recipients.len(),
            processed,
            success_count,
            failed_count,
            success_rate,
            failed_recipients: failed_recipients.to_vec(),
        };

        *self.summary.write().await = Some(summary.clone());

        self.events.emit(ProgressEvent::new(
            self.job_id,
            self.tenant_id,
            EventKind::JobSummary {
                summary: summary.clone(),
            },
        ));
        info!(
            "job {} finished as {}: {} sent, {} failed, {} of {} processed",
            self.job_id,
            state,
            success_count,
            failed_count,
            processed,
            self.recipients.len()
        );

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailburst_common::types::{FailureKind, SendOutcome, SendResult};

    fn result(recipient: &str, sent: bool) -> SendResult {
        SendResult {
            recipient: recipient.to_string(),
            outcome: if sent {
                SendOutcome::Sent
            } else {
                SendOutcome::Failed {
                    kind: FailureKind::Rejected,
                    error: "rejected".to_string(),
                }
            },
            attempts: 1,
            timestamp: Utc::now(),
            elapsed_ms: 1,
        }
    }

    fn outcome(success: usize, failed: usize) -> BatchRunOutcome {
        let mut o = BatchRunOutcome::default();
        for i in 0..success {
            o.results.push(result(&format!("ok{}@x.com", i), true));
        }
        for i in 0..failed {
            o.results.push(result(&format!("bad{}@x.com", i), false));
        }
        o.success_count = success;
        o.failed_count = failed;
        o
    }

    #[test]
    fn test_terminal_state_all_processed() {
        assert_eq!(
            JobCoordinator::terminal_state(&outcome(5, 0), 5),
            JobState::Completed
        );
        assert_eq!(
            JobCoordinator::terminal_state(&outcome(0, 5), 5),
            JobState::Failed
        );
        assert_eq!(
            JobCoordinator::terminal_state(&outcome(3, 2), 5),
            JobState::PartialFailure
        );
    }

    #[test]
    fn test_terminal_state_empty_list_completes() {
        assert_eq!(
            JobCoordinator::terminal_state(&BatchRunOutcome::default(), 0),
            JobState::Completed
        );
    }

    #[test]
    fn test_terminal_state_cancelled_wins() {
        let mut o = outcome(3, 1);
        o.cancelled = true;
        assert_eq!(JobCoordinator::terminal_state(&o, 10), JobState::Cancelled);
    }

    #[test]
    fn test_terminal_state_transport_abort() {
        let mut o = outcome(0, 0);
        o.aborted = Some("auth failed".to_string());
        assert_eq!(JobCoordinator::terminal_state(&o, 10), JobState::Failed);

        let mut o = outcome(4, 1);
        o.aborted = Some("connection lost".to_string());
        assert_eq!(
            JobCoordinator::terminal_state(&o, 10),
            JobState::PartialFailure
        );
    }
}
