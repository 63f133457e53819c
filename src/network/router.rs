//! Message Router
//!
//! Type-keyed fan-out of inbound messages to independent subscribers.
//!
//! Handlers run in global subscription order over a snapshot of the registry
//! taken before the first one is invoked, so a handler may subscribe or
//! unsubscribe (itself included) without affecting the message in flight.
//! A handler that returns an error or panics is logged and skipped; the
//! remaining handlers still see the message.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::network::connection::LatencyTracker;
use crate::network::protocol::{MessageKind, ServerMessage};

/// Handler invoked for each matching message.
pub type Handler = Arc<dyn Fn(&ServerMessage) -> anyhow::Result<()> + Send + Sync>;

/// What a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// Every dispatched message (`"*"`).
    All,
    /// One message type.
    Kind(MessageKind),
}

impl Topic {
    fn matches(self, kind: MessageKind) -> bool {
        match self {
            Topic::All => true,
            Topic::Kind(k) => k == kind,
        }
    }
}

impl From<MessageKind> for Topic {
    fn from(kind: MessageKind) -> Self {
        Topic::Kind(kind)
    }
}

struct Entry {
    id: u64,
    topic: Topic,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }
}

/// Token returned by [`MessageRouter::subscribe`].
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    topic: Topic,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Subscription topic.
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Stop receiving messages. Returns `false` if already unsubscribed.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("subscriptions", &self.entries.lock().len())
            .finish()
    }
}

/// Fan-out of inbound messages by type.
#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<Registry>,
    latency: LatencyTracker,
}

impl MessageRouter {
    /// Create a router that feeds PONG round trips into `latency`.
    pub fn new(latency: LatencyTracker) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            latency,
        }
    }

    /// Register `handler` for `topic`.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, handler: F) -> Subscription
    where
        F: Fn(&ServerMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.entries.lock().push(Entry {
            id,
            topic,
            handler: Arc::new(handler),
        });
        Subscription {
            id,
            topic,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.registry.entries.lock().len()
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.registry.entries.lock().clear();
    }

    /// Deliver `msg` to every matching handler.
    ///
    /// Returns the number of handlers that completed successfully.
    pub fn dispatch(&self, msg: &ServerMessage) -> usize {
        let kind = msg.kind();

        match msg {
            ServerMessage::Pong { t } => {
                if let Some(rtt) = self.latency.record_pong(*t) {
                    trace!(rtt_ms = rtt, "pong");
                }
                return 0;
            }
            ServerMessage::Ping { .. } => {
                trace!("server ping");
                return 0;
            }
            ServerMessage::Error { code, message, id } => {
                warn!(code = %code, id = ?id, "Server error: {}", message);
            }
            _ => {}
        }

        let handlers: Vec<(u64, Handler)> = self
            .registry
            .entries
            .lock()
            .iter()
            .filter(|e| e.topic.matches(kind))
            .map(|e| (e.id, e.handler.clone()))
            .collect();

        let mut delivered = 0;
        for (id, handler) in handlers {
            if invoke_isolated(kind.as_str(), id, || handler(msg)) {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Run a subscriber callback, containing both errors and panics.
pub(crate) fn invoke_isolated(
    what: &str,
    id: u64,
    f: impl FnOnce() -> anyhow::Result<()>,
) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(subscriber = id, "{} handler failed: {:#}", what, e);
            false
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(subscriber = id, "{} handler panicked: {}", what, reason);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    fn router() -> (MessageRouter, Arc<ManualClock>, LatencyTracker) {
        let clock = Arc::new(ManualClock::new(0));
        let latency = LatencyTracker::new(clock.clone());
        (MessageRouter::new(latency.clone()), clock, latency)
    }

    fn chat(text: &str) -> ServerMessage {
        ServerMessage::ChatMessage { from: "gm".into(), text: text.into(), ts: 0 }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> impl Fn(&ServerMessage) -> anyhow::Result<()> {
        let log = log.clone();
        let tag = tag.to_string();
        move |_| {
            log.lock().push(tag.clone());
            Ok(())
        }
    }

    #[test]
    fn test_failing_handler_isolated() {
        let (router, _, _) = router();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.subscribe(MessageKind::ChatMessage, recorder(&log, "first"));
        router.subscribe(MessageKind::ChatMessage, |_| anyhow::bail!("consumer broke"));
        router.subscribe(MessageKind::ChatMessage, recorder(&log, "third"));

        let delivered = router.dispatch(&chat("hi"));

        assert_eq!(delivered, 2);
        assert_eq!(*log.lock(), vec!["first", "third"]);
    }

    #[test]
    fn test_panicking_handler_isolated() {
        let (router, _, _) = router();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.subscribe(MessageKind::ChatMessage, recorder(&log, "first"));
        router.subscribe(MessageKind::ChatMessage, |_| panic!("boom"));
        router.subscribe(MessageKind::ChatMessage, recorder(&log, "third"));

        router.dispatch(&chat("hi"));
        assert_eq!(*log.lock(), vec!["first", "third"]);
    }

    #[test]
    fn test_other_types_not_invoked() {
        let (router, _, _) = router();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(MessageKind::ChatMessage, recorder(&log, "chat"));

        router.dispatch(&ServerMessage::PlayerLeft { player_id: "u".into() });
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_wildcard_in_subscription_order() {
        let (router, _, _) = router();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.subscribe(MessageKind::ChatMessage, recorder(&log, "a"));
        router.subscribe(Topic::All, recorder(&log, "star"));
        router.subscribe(MessageKind::ChatMessage, recorder(&log, "b"));

        router.dispatch(&chat("hi"));
        assert_eq!(*log.lock(), vec!["a", "star", "b"]);

        log.lock().clear();
        router.dispatch(&ServerMessage::PlayerLeft { player_id: "u".into() });
        assert_eq!(*log.lock(), vec!["star"]);
    }

    #[test]
    fn test_unsubscribe_token() {
        let (router, _, _) = router();
        let log = Arc::new(Mutex::new(Vec::new()));

        let sub = router.subscribe(MessageKind::ChatMessage, recorder(&log, "x"));
        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());

        router.dispatch(&chat("hi"));
        assert!(log.lock().is_empty());
        assert_eq!(router.subscription_count(), 0);
    }

    #[test]
    fn test_unsubscribe_during_dispatch_keeps_snapshot() {
        let (router, _, _) = router();
        let log = Arc::new(Mutex::new(Vec::new()));
        let later: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let later_ref = later.clone();
        router.subscribe(MessageKind::ChatMessage, move |_| {
            if let Some(sub) = later_ref.lock().take() {
                sub.unsubscribe();
            }
            Ok(())
        });
        *later.lock() = Some(router.subscribe(MessageKind::ChatMessage, recorder(&log, "second")));

        // Removed mid-dispatch, still sees this message.
        router.dispatch(&chat("one"));
        assert_eq!(log.lock().len(), 1);

        router.dispatch(&chat("two"));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_pong_records_latency_and_is_not_dispatched() {
        let (router, clock, latency) = router();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(Topic::All, recorder(&log, "star"));

        clock.set(1000);
        latency.record_ping_sent(1000);
        clock.set(1120);
        router.dispatch(&ServerMessage::Pong { t: Some(1000) });

        assert_eq!(latency.latency_ms(), Some(120));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_error_is_forwarded() {
        let (router, _, _) = router();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(MessageKind::Error, recorder(&log, "error"));
        router.subscribe(Topic::All, recorder(&log, "star"));

        router.dispatch(&ServerMessage::Error {
            code: "FORBIDDEN".into(),
            message: "nope".into(),
            id: None,
        });
        assert_eq!(*log.lock(), vec!["error", "star"]);
    }
}
