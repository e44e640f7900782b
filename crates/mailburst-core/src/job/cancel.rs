//! Cooperative cancellation signalling

use std::time::Duration;
use tokio::sync::watch;

/// Cancellation handle observed at suspension-point boundaries: before a
/// send, during retry backoff, and during pacing delays. Never interrupts
/// a send mid-flight.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: watch::Sender<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Request cancellation. Idempotent; acknowledgement is asynchronous.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Sleep for the full duration unless cancelled first. Returns true
    /// when the sleep ran to completion.
    pub async fn sleep_unless_cancelled(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_is_observed() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());
        // Resolves immediately once already cancelled
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancel_from_clone() {
        let token = CancelToken::new();
        let clone = token.clone();

        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_cancel() {
        let token = CancelToken::new();
        assert!(token.sleep_unless_cancelled(Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_cancel() {
        let token = CancelToken::new();
        let sleeper = token.clone();

        let handle = tokio::spawn(async move {
            sleeper
                .sleep_unless_cancelled(Duration::from_secs(3600))
                .await
        });

        tokio::task::yield_now().await;
        token.cancel();
        assert!(!handle.await.unwrap());
    }
}
