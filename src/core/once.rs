//! Single-Resolution Outcome
//!
//! A value that several competing paths (message handlers, timers) may try
//! to produce, of which exactly one wins. The winner takes the oneshot sender
//! out of the slot and cancels the shared token; every later attempt is a
//! no-op that reports `false`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Resolves a pending outcome at most once.
#[derive(Debug)]
pub struct OnceResolver<T> {
    slot: Mutex<Option<oneshot::Sender<T>>>,
    token: CancellationToken,
}

impl<T> OnceResolver<T> {
    /// Create a resolver and the receiver its outcome is delivered to.
    pub fn new() -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let resolver = Arc::new(Self {
            slot: Mutex::new(Some(tx)),
            token: CancellationToken::new(),
        });
        (resolver, rx)
    }

    /// Deliver `value` if nothing has resolved yet.
    ///
    /// Returns `true` only for the call that won.
    pub fn resolve(&self, value: T) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let Some(tx) = self.slot.lock().take() else {
            return false;
        };
        self.token.cancel();
        // The waiter may already be gone; the outcome is still settled.
        let _ = tx.send(value);
        true
    }

    /// Abandon the outcome without a value. The receiver sees a closed channel.
    pub fn cancel(&self) {
        self.slot.lock().take();
        self.token.cancel();
    }

    /// Whether a value was delivered or the outcome was abandoned.
    pub fn is_settled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token cancelled the moment the outcome settles.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the outcome, resolving with `on_timeout()` if `limit` elapses first.
    ///
    /// The timer is dropped as soon as any other path settles. Returns `None`
    /// only if the outcome was abandoned through [`OnceResolver::cancel`].
    pub async fn wait(
        &self,
        receiver: oneshot::Receiver<T>,
        limit: Duration,
        on_timeout: impl FnOnce() -> T,
    ) -> Option<T> {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep(limit) => {
                self.resolve(on_timeout());
            }
        }
        receiver.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_resolution_wins() {
        let (resolver, mut rx) = OnceResolver::new();

        assert!(resolver.resolve("joined"));
        assert!(!resolver.resolve("error"));
        assert!(resolver.is_settled());
        assert_eq!(rx.try_recv().unwrap(), "joined");
    }

    #[test]
    fn test_cancel_closes_receiver() {
        let (resolver, mut rx) = OnceResolver::<u32>::new();
        resolver.cancel();

        assert!(!resolver.resolve(7));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let (resolver, rx) = OnceResolver::new();

        let outcome = resolver
            .wait(rx, Duration::from_secs(3), || "timed out")
            .await;

        assert_eq!(outcome, Some("timed out"));
        assert!(!resolver.resolve("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_early_resolution() {
        let (resolver, rx) = OnceResolver::new();
        let racer = resolver.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            racer.resolve(1u32);
        });

        let started = tokio::time::Instant::now();
        let outcome = resolver.wait(rx, Duration::from_secs(3), || 0).await;

        assert_eq!(outcome, Some(1));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
