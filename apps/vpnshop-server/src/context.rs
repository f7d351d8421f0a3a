use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const CREATE_PAYMENT_TIMEOUT: Duration = Duration::from_secs(30);
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
pub const PANEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline plus cancellation, threaded through every outbound call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    DeadlineExceeded,
    Canceled,
}

impl CallContext {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(timeout, CancellationToken::new())
    }

    /// Child context whose deadline never extends past the parent's.
    pub fn child(&self, timeout: Duration) -> Self {
        Self {
            deadline: self.deadline.min(Instant::now() + timeout),
            cancel: self.cancel.child_token(),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    pub async fn run<F, T>(&self, fut: F) -> Result<T, Interrupted>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Canceled),
            result = tokio::time::timeout_at(self.deadline, fut) => {
                result.map_err(|_| Interrupted::DeadlineExceeded)
            }
        }
    }
}

/// Installs ring as the process-wide rustls provider for outbound TLS.
/// Returns false when some provider was already installed; that one stays.
pub fn install_crypto_provider() -> bool {
    match rustls::crypto::ring::default_provider().install_default() {
        Ok(()) => true,
        Err(_) => {
            tracing::debug!("A rustls crypto provider was already installed, keeping it");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_provider_installs_once() {
        install_crypto_provider();
        assert!(!install_crypto_provider());
        assert!(rustls::crypto::CryptoProvider::get_default().is_some());
    }

    #[tokio::test]
    async fn deadline_interrupts_slow_calls() {
        let ctx = CallContext::with_timeout(Duration::from_millis(10));
        let result = ctx.run(tokio::time::sleep(Duration::from_secs(5))).await;
        assert_eq!(result, Err(Interrupted::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_work() {
        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        ctx.cancel.cancel();
        let result = ctx.run(async { 1 }).await;
        assert_eq!(result, Err(Interrupted::Canceled));
    }

    #[tokio::test]
    async fn child_never_outlives_parent() {
        let parent = CallContext::with_timeout(Duration::from_millis(50));
        let child = parent.child(Duration::from_secs(60));
        assert!(child.deadline <= parent.deadline);
        parent.cancel.cancel();
        assert!(child.is_done());
    }
}
