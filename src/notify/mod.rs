pub mod discord;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{MAX_NOTIFY_ATTEMPTS, NOTIFY_BACKOFF_BASE_MS};
use crate::types::NotificationEvent;

#[derive(Debug, Error)]
pub enum NotifyError {
    /// Missing or malformed target. Never retried and never authorizes
    /// marking the listing seen.
    #[error("invalid notification target: {0}")]
    InvalidTarget(String),
    /// Transient transport failure (timeout, rate limit, 5xx). Retried.
    #[error("transport error: {0}")]
    Transport(String),
    /// The notifier rejected the payload outright.
    #[error("rejected by notifier: {0}")]
    Rejected(String),
}

impl NotifyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, NotifyError::Transport(_))
    }
}

/// Final verdict of one dispatch. Only Delivered authorizes the executor to
/// write the seen record; a failed dispatch leaves the listing eligible for
/// the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Delivered,
    Failed { retryable: bool },
}

impl DispatchResult {
    pub fn authorizes_seen(&self) -> bool {
        matches!(self, DispatchResult::Delivered)
    }
}

/// The outbound transport. One call = one delivery attempt; retry policy
/// lives in the dispatcher.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Wraps a transport with a bounded retry loop: up to `max_attempts`
/// deliveries with a doubling backoff on retryable errors.
pub struct Dispatcher {
    transport: Arc<dyn Notifier>,
    max_attempts: u8,
    backoff_base: Duration,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Notifier>) -> Self {
        Self {
            transport,
            max_attempts: MAX_NOTIFY_ATTEMPTS,
            backoff_base: Duration::from_millis(NOTIFY_BACKOFF_BASE_MS),
        }
    }

    #[cfg(test)]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub async fn dispatch(&self, event: &NotificationEvent) -> DispatchResult {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            match self.transport.send(event).await {
                Ok(()) => {
                    debug!(
                        watch = %event.watch_name,
                        listing = %event.listing.listing_id,
                        attempt,
                        "Notification delivered"
                    );
                    return DispatchResult::Delivered;
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        watch = %event.watch_name,
                        listing = %event.listing.listing_id,
                        attempt,
                        "Notification attempt failed, retrying: {e}"
                    );
                    tokio::time::sleep(self.backoff_base * (1 << (attempt - 1))).await;
                }
                Err(e) => {
                    warn!(
                        watch = %event.watch_name,
                        listing = %event.listing.listing_id,
                        attempt,
                        "Notification failed: {e}"
                    );
                    return DispatchResult::Failed { retryable: e.is_retryable() };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawListing;
    use std::sync::atomic::{AtomicU8, Ordering};

    fn event() -> NotificationEvent {
        NotificationEvent {
            watch_name: "w".to_string(),
            listing: RawListing {
                listing_id: "X".to_string(),
                title: "Jacket".to_string(),
                price_amount: 10.0,
                price_currency: "EUR".to_string(),
                url: "https://example/items/X".to_string(),
                thumbnail_url: None,
                brand: None,
                size: None,
                condition: None,
                seller_rating: None,
                seller_feedback_count: None,
                observed_at: 0,
            },
            webhook: Some("https://discord.example/webhook".to_string()),
        }
    }

    /// Fails the first `fail_first` sends with a transport error.
    struct FlakyNotifier {
        fail_first: u8,
        sends: AtomicU8,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn send(&self, _event: &NotificationEvent) -> Result<(), NotifyError> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(NotifyError::Transport("timeout".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct BadTargetNotifier {
        sends: AtomicU8,
    }

    #[async_trait]
    impl Notifier for BadTargetNotifier {
        async fn send(&self, _event: &NotificationEvent) -> Result<(), NotifyError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Err(NotifyError::InvalidTarget("no webhook configured".to_string()))
        }
    }

    #[tokio::test]
    async fn delivers_on_third_attempt_after_two_transient_failures() {
        let transport = Arc::new(FlakyNotifier { fail_first: 2, sends: AtomicU8::new(0) });
        let dispatcher =
            Dispatcher::new(transport.clone()).with_backoff_base(Duration::from_millis(0));

        let result = dispatcher.dispatch(&event()).await;
        assert_eq!(result, DispatchResult::Delivered);
        assert!(result.authorizes_seen());
        assert_eq!(transport.sends.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_retryable_failure() {
        let transport = Arc::new(FlakyNotifier { fail_first: 10, sends: AtomicU8::new(0) });
        let dispatcher =
            Dispatcher::new(transport.clone()).with_backoff_base(Duration::from_millis(0));

        let result = dispatcher.dispatch(&event()).await;
        assert_eq!(result, DispatchResult::Failed { retryable: true });
        assert!(!result.authorizes_seen());
        assert_eq!(transport.sends.load(Ordering::SeqCst), MAX_NOTIFY_ATTEMPTS);
    }

    #[tokio::test]
    async fn invalid_target_fails_without_retry() {
        let transport = Arc::new(BadTargetNotifier { sends: AtomicU8::new(0) });
        let dispatcher =
            Dispatcher::new(transport.clone()).with_backoff_base(Duration::from_millis(0));

        let result = dispatcher.dispatch(&event()).await;
        assert_eq!(result, DispatchResult::Failed { retryable: false });
        assert_eq!(transport.sends.load(Ordering::SeqCst), 1);
    }
}
