//! Batch processor - ordered batches, inter-send pacing, smart delay

use crate::dispatch::{DispatchAbort, Dispatcher};
use crate::events::EventBus;
use crate::job::{CancelToken, JobCounters};
use mailburst_common::config::EngineConfig;
use mailburst_common::types::{EventKind, JobId, MessagePayload, ProgressEvent, SendResult, TenantId};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pacing knobs for one job run
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub batch_size: usize,
    /// Base inter-send delay; the actual wait is drawn from [base, base+2)
    pub inter_send_delay_secs: f64,
    pub inter_batch_delay_secs: f64,
    /// Batches with fewer successes double the next inter-batch delay
    pub low_success_threshold: usize,
}

impl PacingConfig {
    /// Engine-wide defaults plus the job's configured inter-send delay.
    pub fn from_engine(engine: &EngineConfig, inter_send_delay_secs: f64) -> Self {
        Self {
            batch_size: engine.batch_size.max(1),
            inter_send_delay_secs,
            inter_batch_delay_secs: engine.inter_batch_delay_secs,
            low_success_threshold: engine.low_success_threshold,
        }
    }
}

/// What a full run over a recipient list produced
#[derive(Debug, Default)]
pub struct BatchRunOutcome {
    /// One entry per processed recipient, list order; unprocessed
    /// recipients have no entry.
    pub results: Vec<SendResult>,
    pub success_count: usize,
    pub failed_count: usize,
    /// Set when the relay never became available and the run stopped early
    pub aborted: Option<String>,
    pub cancelled: bool,
}

impl BatchRunOutcome {
    pub fn processed(&self) -> usize {
        self.results.len()
    }
}

enum Stop {
    Cancelled,
    Aborted(String),
}

/// Drives one job's recipient list through the dispatcher: fixed-size
/// ordered batches, strictly sequential sends, paced so the relay sees one
/// connection performing ordered sends.
pub struct BatchProcessor {
    dispatcher: Dispatcher,
    pacing: PacingConfig,
    events: EventBus,
    job_id: JobId,
    tenant_id: TenantId,
}

impl BatchProcessor {
    pub fn new(
        dispatcher: Dispatcher,
        pacing: PacingConfig,
        events: EventBus,
        job_id: JobId,
        tenant_id: TenantId,
    ) -> Self {
        Self {
            dispatcher,
            pacing,
            events,
            job_id,
            tenant_id,
        }
    }

    pub async fn process(
        &self,
        recipients: &[String],
        payload: &MessagePayload,
        cancel: &CancelToken,
        counters: &JobCounters,
    ) -> BatchRunOutcome {
        let mut outcome = BatchRunOutcome::default();
        if recipients.is_empty() {
            return outcome;
        }

        let batch_count = recipients.len().div_ceil(self.pacing.batch_size);
        let mut inter_batch_delay = self.pacing.inter_batch_delay_secs;

        for (index, batch) in recipients.chunks(self.pacing.batch_size).enumerate() {
            if index > 0 {
                debug!(
                    "waiting {:.1}s before batch {}/{}",
                    inter_batch_delay,
                    index + 1,
                    batch_count
                );
                if !cancel
                    .sleep_unless_cancelled(Duration::from_secs_f64(inter_batch_delay))
                    .await
                {
                    outcome.cancelled = true;
                    break;
                }
            }

            let started = tokio::time::Instant::now();
            let (batch_success, batch_failed, stop) = self
                .process_batch(batch, payload, cancel, counters, &mut outcome)
                .await;

            self.events.emit(ProgressEvent::new(
                self.job_id,
                self.tenant_id,
                EventKind::BatchSummary {
                    batch_index: index + 1,
                    batch_count,
                    processed: batch_success + batch_failed,
                    success_count: batch_success,
                    failed_count: batch_failed,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                },
            ));
            info!(
                "batch {}/{} done: {} sent, {} failed",
                index + 1,
                batch_count,
                batch_success,
                batch_failed
            );

            outcome.success_count += batch_success;
            outcome.failed_count += batch_failed;

            match stop {
                Some(Stop::Cancelled) => {
                    outcome.cancelled = true;
                    break;
                }
                Some(Stop::Aborted(reason)) => {
                    outcome.aborted = Some(reason);
                    break;
                }
                None => {}
            }

            inter_batch_delay = next_inter_batch_delay(
                self.pacing.inter_batch_delay_secs,
                batch_success,
                self.pacing.low_success_threshold,
            );
        }

        outcome
    }

    /// Process one batch in list order; returns its counters and why it
    /// stopped early, if it did.
    async fn process_batch(
        &self,
        batch: &[String],
        payload: &MessagePayload,
        cancel: &CancelToken,
        counters: &JobCounters,
        outcome: &mut BatchRunOutcome,
    ) -> (usize, usize, Option<Stop>) {
        let mut success = 0usize;
        let mut failed = 0usize;

        for (pos, recipient) in batch.iter().enumerate() {
            if cancel.is_cancelled() {
                return (success, failed, Some(Stop::Cancelled));
            }

            let result = match self.dispatcher.send(payload, recipient, cancel).await {
                Ok(result) => result,
                Err(DispatchAbort::TransportUnavailable(reason)) => {
                    warn!(
                        "relay unavailable, stopping run; {} stays unprocessed: {}",
                        recipient, reason
                    );
                    return (success, failed, Some(Stop::Aborted(reason)));
                }
            };

            let attempted = result.attempts > 0;
            if result.outcome.is_sent() {
                success += 1;
                counters.record_success();
            } else {
                failed += 1;
                counters.record_failure();
            }
            outcome.results.push(result);

            // Pace only after sends that reached the relay, and never
            // after a batch's last recipient
            if attempted && pos + 1 < batch.len() {
                let wait = jittered_delay(self.pacing.inter_send_delay_secs);
                debug!("waiting {:.1}s before sending to {}", wait, batch[pos + 1]);
                if !cancel
                    .sleep_unless_cancelled(Duration::from_secs_f64(wait))
                    .await
                {
                    return (success, failed, Some(Stop::Cancelled));
                }
            }
        }

        (success, failed, None)
    }
}

/// Uniform draw from [base, base + 2) seconds.
fn jittered_delay(base: f64) -> f64 {
    use rand::Rng as _;
    rand::rng().random_range(base..base + 2.0)
}

/// Success counts under the threshold double the next inter-batch gap.
fn next_inter_batch_delay(base: f64, success_count: usize, threshold: usize) -> f64 {
    if success_count < threshold {
        base * 2.0
    } else {
        base
    }
}
