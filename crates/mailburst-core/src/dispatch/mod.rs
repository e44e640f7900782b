//! Dispatcher - single-recipient sends with bounded retry and backoff

use crate::events::EventBus;
use crate::job::CancelToken;
use crate::transport::{MailTransport, TransportError};
use crate::validate::{RecipientValidator, Verdict};
use chrono::Utc;
use mailburst_common::types::{
    AttemptOutcome, EventKind, FailureKind, JobId, MessagePayload, ProgressEvent, SendOutcome,
    SendResult, TenantId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded attempts with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per recipient, including the first
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per further attempt
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Backoff after `completed` attempts have failed: base, 2x, 4x, ...
    pub fn backoff(&self, completed: u32) -> Duration {
        self.base_delay * 2u32.pow(completed.saturating_sub(1).min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// The dispatch run cannot continue for this job
#[derive(Debug, thiserror::Error)]
pub enum DispatchAbort {
    /// The relay never became available for this send; the recipient is
    /// left unprocessed and the batch layer stops the run.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}

enum SendState {
    Attempt(u32),
    RetryWait { completed: u32, error: TransportError },
}

/// Sends one message to one recipient: validate, then attempt with
/// retries. Pacing between recipients is the batch processor's concern;
/// each `send` call is synchronous from the caller's point of view.
pub struct Dispatcher {
    validator: Arc<RecipientValidator>,
    transport: Arc<dyn MailTransport>,
    policy: RetryPolicy,
    events: EventBus,
    job_id: JobId,
    tenant_id: TenantId,
}

impl Dispatcher {
    pub fn new(
        validator: Arc<RecipientValidator>,
        transport: Arc<dyn MailTransport>,
        policy: RetryPolicy,
        events: EventBus,
        job_id: JobId,
        tenant_id: TenantId,
    ) -> Self {
        Self {
            validator,
            transport,
            policy,
            events,
            job_id,
            tenant_id,
        }
    }

    /// Dispatch one recipient. Invalid recipients fail immediately with no
    /// network attempt. Transient failures retry up to the policy's
    /// maximum with doubling backoff; permanent rejections never retry.
    pub async fn send(
        &self,
        payload: &MessagePayload,
        recipient: &str,
        cancel: &CancelToken,
    ) -> Result<SendResult, DispatchAbort> {
        let started = std::time::Instant::now();

        if let Verdict::Invalid(reason) = self.validator.verify(recipient).await {
            self.emit_attempt(recipient, 0, AttemptOutcome::Invalid, Some(reason.to_string()));
            return Ok(SendResult {
                recipient: recipient.to_string(),
                outcome: SendOutcome::Failed {
                    kind: FailureKind::Validation(reason),
                    error: format!("validation failed: {}", reason),
                },
                attempts: 0,
                timestamp: Utc::now(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let mut state = SendState::Attempt(1);
        loop {
            match state {
                SendState::Attempt(attempt) => {
                    match self.transport.send(payload, recipient).await {
                        Ok(()) => {
                            self.emit_attempt(recipient, attempt, AttemptOutcome::Sent, None);
                            debug!("sent to {} on attempt {}", recipient, attempt);
                            return Ok(self.finished(recipient, SendOutcome::Sent, attempt, started));
                        }
                        Err(TransportError::Permanent(error)) => {
                            self.emit_attempt(
                                recipient,
                                attempt,
                                AttemptOutcome::PermanentFailure,
                                Some(error.clone()),
                            );
                            return Ok(self.finished(
                                recipient,
                                SendOutcome::Failed {
                                    kind: FailureKind::Rejected,
                                    error,
                                },
                                attempt,
                                started,
                            ));
                        }
                        Err(retryable) => {
                            let outcome = match &retryable {
                                TransportError::Unavailable(_) => {
                                    AttemptOutcome::TransportUnavailable
                                }
                                _ => AttemptOutcome::TransientFailure,
                            };
                            self.emit_attempt(
                                recipient,
                                attempt,
                                outcome,
                                Some(retryable.to_string()),
                            );

                            if attempt >= self.policy.max_attempts {
                                return match retryable {
                                    TransportError::Unavailable(error) => {
                                        Err(DispatchAbort::TransportUnavailable(error))
                                    }
                                    other => Ok(self.finished(
                                        recipient,
                                        SendOutcome::Failed {
                                            kind: FailureKind::Rejected,
                                            error: format!(
                                                "{} (gave up after {} attempts)",
                                                other, attempt
                                            ),
                                        },
                                        attempt,
                                        started,
                                    )),
                                };
                            }
                            state = SendState::RetryWait {
                                completed: attempt,
                                error: retryable,
                            };
                        }
                    }
                }
                SendState::RetryWait { completed, error } => {
                    let delay = self.policy.backoff(completed);
                    debug!(
                        "retrying {} in {:?} (attempt {} of {})",
                        recipient,
                        delay,
                        completed + 1,
                        self.policy.max_attempts
                    );
                    if !cancel.sleep_unless_cancelled(delay).await {
                        warn!("cancelled during retry backoff for {}", recipient);
                        return Ok(self.finished(
                            recipient,
                            SendOutcome::Failed {
                                kind: FailureKind::Rejected,
                                error: format!("{} (cancelled before retry)", error),
                            },
                            completed,
                            started,
                        ));
                    }
                    state = SendState::Attempt(completed + 1);
                }
            }
        }
    }

    fn finished(
        &self,
        recipient: &str,
        outcome: SendOutcome,
        attempts: u32,
        started: std::time::Instant,
    ) -> SendResult {
        SendResult {
            recipient: recipient.to_string(),
            outcome,
            attempts,
            timestamp: Utc::now(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn emit_attempt(
        &self,
        recipient: &str,
        attempt: u32,
        outcome: AttemptOutcome,
        detail: Option<String>,
    ) {
        self.events.emit(ProgressEvent::new(
            self.job_id,
            self.tenant_id,
            EventKind::SendAttempt {
                recipient: recipient.to_string(),
                attempt,
                outcome,
                detail,
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::{DomainCache, LookupFailure, MxLookup};
    use async_trait::async_trait;
    use mailburst_common::types::InvalidReason;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct AlwaysMx;

    #[async_trait]
    impl MxLookup for AlwaysMx {
        async fn has_mx(&self, _domain: &str) -> Result<bool, LookupFailure> {
            Ok(true)
        }
    }

    /// Transport that plays back a fixed script of outcomes, then succeeds.
    struct ScriptedTransport {
        script: Vec<Option<TransportError>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Option<TransportError>>) -> Self {
            Self {
                script,
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MailTransport for ScriptedTransport {
        async fn send(
            &self,
            _payload: &MessagePayload,
            _recipient: &str,
        ) -> Result<(), TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.get(call) {
                Some(Some(error)) => Err(error.clone()),
                _ => Ok(()),
            }
        }
    }

    fn payload() -> MessagePayload {
        MessagePayload {
            subject: "s".to_string(),
            body_html: "<p>b</p>".to_string(),
            attachments: vec![],
        }
    }

    fn dispatcher(transport: Arc<ScriptedTransport>, events: EventBus) -> Dispatcher {
        let validator = Arc::new(RecipientValidator::new(
            DomainCache::with_ttl_hours(24),
            Arc::new(AlwaysMx),
        ));
        Dispatcher::new(
            validator,
            transport,
            RetryPolicy::default(),
            events,
            Uuid::new_v4(),
            Uuid::new_v4(),
        )
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Some(TransportError::Transient("451".to_string())),
            Some(TransportError::Transient("451".to_string())),
            None,
        ]));
        let d = dispatcher(transport.clone(), EventBus::default());

        let result = d
            .send(&payload(), "user@example.com", &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcome, SendOutcome::Sent);
        assert_eq!(result.attempts, 3);
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhaustion_gives_up() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Some(TransportError::Transient("451".to_string())),
            Some(TransportError::Transient("451".to_string())),
            Some(TransportError::Transient("451".to_string())),
            Some(TransportError::Transient("451".to_string())),
        ]));
        let d = dispatcher(transport.clone(), EventBus::default());

        let result = d
            .send(&payload(), "user@example.com", &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(result.attempts, 3);
        assert!(matches!(
            result.outcome,
            SendOutcome::Failed {
                kind: FailureKind::Rejected,
                ..
            }
        ));
        // No attempts beyond the maximum
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![Some(
            TransportError::Permanent("550 user unknown".to_string()),
        )]));
        let d = dispatcher(transport.clone(), EventBus::default());

        let result = d
            .send(&payload(), "user@example.com", &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_recipient_skips_network() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let d = dispatcher(transport.clone(), EventBus::default());

        let result = d
            .send(&payload(), "not-an-email", &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(result.attempts, 0);
        assert!(matches!(
            result.outcome,
            SendOutcome::Failed {
                kind: FailureKind::Validation(InvalidReason::BadFormat),
                ..
            }
        ));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_through_all_retries_aborts() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Some(TransportError::Unavailable("auth failed".to_string())),
            Some(TransportError::Unavailable("auth failed".to_string())),
            Some(TransportError::Unavailable("auth failed".to_string())),
        ]));
        let d = dispatcher(transport.clone(), EventBus::default());

        let outcome = d
            .send(&payload(), "user@example.com", &CancelToken::new())
            .await;

        assert!(matches!(
            outcome,
            Err(DispatchAbort::TransportUnavailable(_))
        ));
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_attempt_emits_event() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Some(TransportError::Transient("451".to_string())),
            None,
        ]));
        let events = EventBus::new(32);
        let mut rx = events.subscribe();
        let d = dispatcher(transport, events);

        let result = d
            .send(&payload(), "user@example.com", &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(result.attempts, 2);

        let mut attempts = vec![];
        while let Ok(event) = rx.try_recv() {
            if let EventKind::SendAttempt {
                attempt, outcome, ..
            } = event.event
            {
                attempts.push((attempt, outcome));
            }
        }
        assert_eq!(
            attempts,
            vec![
                (1, AttemptOutcome::TransientFailure),
                (2, AttemptOutcome::Sent),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retries() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Some(TransportError::Transient("451".to_string())),
            None,
        ]));
        let d = dispatcher(transport.clone(), EventBus::default());
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = d
            .send(&payload(), "user@example.com", &cancel)
            .await
            .unwrap();

        // The failed first attempt stands; the retry never ran
        assert_eq!(result.attempts, 1);
        assert_eq!(transport.call_count(), 1);
        assert!(matches!(result.outcome, SendOutcome::Failed { .. }));
    }
}
