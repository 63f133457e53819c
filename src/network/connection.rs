//! Connection Manager
//!
//! Owns the transport lifecycle: connect, reconnect with backoff, liveness
//! pings and latency measurement.
//!
//! ```text
//!   connect()          link opened
//! Disconnected ──▶ Connecting ──────────▶ Open
//!      ▲               │                   │
//!      │  refused      │      closed/error │
//!      └───────────────┴───────────────────┘
//!      │  backoff min(1000 * 2^n, 30000) ms, n < 10
//!      ▼
//!   Failed (no further retries)
//! ```
//!
//! A single driver task per `connect()` owns the link, the ping ticker and
//! the backoff timer. Listener callbacks run on that task, one at a time.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ConnectionConfig;
use crate::core::clock::Clock;
use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::network::router::invoke_isolated;
use crate::network::transport::Connector;

/// Transport state. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; a reconnect may be pending.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport open, messages flow.
    Open,
    /// Reconnect attempts exhausted. Only an explicit `connect()` leaves this state.
    Failed,
}

impl ConnectionState {
    /// Short lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Failed => "failed",
        }
    }
}

/// Connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Message dropped because the transport is not open.
    #[error("not connected (state: {})", .0.as_str())]
    NotConnected(ConnectionState),

    /// Outbound buffer full; message dropped.
    #[error("outbound queue full")]
    Backpressure,

    /// Message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// State change listener.
pub type StateListener = Arc<dyn Fn(ConnectionState) -> anyhow::Result<()> + Send + Sync>;

/// Inbound message listener.
pub type MessageListener = Arc<dyn Fn(&ServerMessage) -> anyhow::Result<()> + Send + Sync>;

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

// =============================================================================
// LATENCY
// =============================================================================

#[derive(Debug, Default)]
struct LatencyInner {
    last_ping_sent: Option<u64>,
    latency_ms: Option<u64>,
}

/// Round-trip estimate shared between the ping sender and the router.
#[derive(Clone)]
pub struct LatencyTracker {
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<LatencyInner>>,
}

impl LatencyTracker {
    /// Tracker reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Arc::new(Mutex::new(LatencyInner::default())),
        }
    }

    /// Current time from the tracker's clock (ms).
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Remember when the last PING left.
    pub fn record_ping_sent(&self, t: u64) {
        self.inner.lock().last_ping_sent = Some(t);
    }

    /// Record a PONG. Uses the echoed time, or the last PING if none was echoed.
    ///
    /// Returns the round trip, or `None` if nothing can be correlated.
    pub fn record_pong(&self, echoed: Option<u64>) -> Option<u64> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        let sent = echoed.or(inner.last_ping_sent)?;
        let rtt = now.saturating_sub(sent);
        inner.latency_ms = Some(rtt);
        Some(rtt)
    }

    /// Latest round-trip estimate (ms).
    pub fn latency_ms(&self) -> Option<u64> {
        self.inner.lock().latency_ms
    }

    /// Forget the estimate, e.g. after the connection drops.
    pub fn reset(&self) {
        *self.inner.lock() = LatencyInner::default();
    }
}

impl std::fmt::Debug for LatencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyTracker")
            .field("latency_ms", &self.latency_ms())
            .finish()
    }
}

// =============================================================================
// CONNECTION MANAGER
// =============================================================================

struct Run {
    generation: u64,
    token: CancellationToken,
    /// Set while a backoff sleep is pending; cancelling it reconnects at once.
    backoff: Option<CancellationToken>,
}

struct Shared {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    latency: LatencyTracker,
    state_tx: watch::Sender<ConnectionState>,
    visible_tx: watch::Sender<bool>,
    link: Mutex<Option<mpsc::Sender<String>>>,
    run: Mutex<Option<Run>>,
    generation: AtomicU64,
    attempt: AtomicU32,
    next_listener: AtomicU64,
    state_listeners: Mutex<Vec<(u64, StateListener)>>,
    message_listeners: Mutex<Vec<(u64, MessageListener)>>,
}

/// Owner of the transport. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        latency: LatencyTracker,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (visible_tx, _) = watch::channel(true);

        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                latency,
                state_tx,
                visible_tx,
                link: Mutex::new(None),
                run: Mutex::new(None),
                generation: AtomicU64::new(0),
                attempt: AtomicU32::new(0),
                next_listener: AtomicU64::new(0),
                state_listeners: Mutex::new(Vec::new()),
                message_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start connecting.
    ///
    /// While a reconnect is waiting out its backoff, the wait is cut short and
    /// the attempt count starts over. No-op while connecting or open.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let (generation, token) = {
            let mut run = self.shared.run.lock();
            if let Some(active) = run.as_mut() {
                match active.backoff.take() {
                    Some(backoff) => {
                        info!("Connect requested, skipping backoff");
                        self.shared.attempt.store(0, Ordering::SeqCst);
                        backoff.cancel();
                    }
                    None => debug!("connect() ignored: connection already active"),
                }
                return;
            }
            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let token = CancellationToken::new();
            *run = Some(Run { generation, token: token.clone(), backoff: None });
            (generation, token)
        };

        self.shared.attempt.store(0, Ordering::SeqCst);
        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.drive(generation, token).await;
        });
    }

    /// Close the transport and cancel any pending reconnect.
    pub fn disconnect(&self) {
        let run = self.shared.run.lock().take();
        if let Some(run) = run {
            run.token.cancel();
            info!("Disconnect requested");
        }
        self.shared.link.lock().take();
        self.shared.attempt.store(0, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Send a message. Dropped (not queued) unless the connection is open.
    pub fn send(&self, msg: &ClientMessage) -> Result<(), ConnectionError> {
        self.shared.send(msg)
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Whether messages can be sent right now.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Receiver that observes every state change.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Latest round-trip estimate (ms).
    pub fn latency_ms(&self) -> Option<u64> {
        self.shared.latency.latency_ms()
    }

    /// Shared latency tracker.
    pub fn latency_tracker(&self) -> LatencyTracker {
        self.shared.latency.clone()
    }

    /// Reconnects scheduled since the last successful open.
    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.attempt.load(Ordering::SeqCst)
    }

    /// Suspend (`true`) or resume (`false`) liveness pings.
    pub fn set_backgrounded(&self, backgrounded: bool) {
        self.shared.visible_tx.send_replace(!backgrounded);
    }

    /// Call `listener` on every state transition.
    pub fn on_state_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ConnectionState) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared.state_listeners.lock().push((id, Arc::new(listener)));
        ListenerId(id)
    }

    /// Call `listener` for every decoded inbound message.
    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ServerMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared.message_listeners.lock().push((id, Arc::new(listener)));
        ListenerId(id)
    }

    /// Remove a listener added with `on_state_change` or `on_message`.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut removed = false;
        self.shared.state_listeners.lock().retain(|(lid, _)| {
            let keep = *lid != id.0;
            removed |= !keep;
            keep
        });
        self.shared.message_listeners.lock().retain(|(lid, _)| {
            let keep = *lid != id.0;
            removed |= !keep;
            keep
        });
        removed
    }
}

impl Shared {
    /// One connection run: connect, pump, back off, repeat until cancelled or failed.
    #[instrument(skip(self, token), fields(url = %self.config.url))]
    async fn drive(self: Arc<Self>, generation: u64, token: CancellationToken) {
        loop {
            if !self.enter(&token, ConnectionState::Connecting) {
                return;
            }

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = self.connector.connect(&self.config.url) => result,
            };

            match result {
                Ok(link) => {
                    if token.is_cancelled() {
                        return;
                    }
                    self.attempt.store(0, Ordering::SeqCst);
                    *self.link.lock() = Some(link.outgoing);
                    if !self.enter(&token, ConnectionState::Open) {
                        self.link.lock().take();
                        return;
                    }
                    info!("Connected");

                    self.pump(link.incoming, &token).await;

                    self.link.lock().take();
                    self.latency.reset();
                    if token.is_cancelled() {
                        return;
                    }
                    warn!("Connection lost");
                }
                Err(e) => {
                    if token.is_cancelled() {
                        return;
                    }
                    warn!("Failed to connect: {}", e);
                }
            }
            if !self.enter(&token, ConnectionState::Disconnected) {
                return;
            }

            let attempt = self.attempt.load(Ordering::SeqCst);
            if !self.config.reconnect.allows(attempt) {
                error!("Giving up after {} reconnect attempts", attempt);
                self.release_run(generation);
                self.enter(&token, ConnectionState::Failed);
                return;
            }

            let delay = self.config.reconnect.delay_for(attempt);
            self.attempt.store(attempt + 1, Ordering::SeqCst);
            info!("Reconnecting in {:?} (attempt {})", delay, attempt + 1);

            let skip = CancellationToken::new();
            if !self.arm_backoff(generation, skip.clone()) {
                return;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = skip.cancelled() => debug!("Backoff cut short"),
                _ = tokio::time::sleep(delay) => {}
            }
            self.disarm_backoff(generation);
        }
    }

    /// Publish a state on behalf of the run owning `token`.
    ///
    /// Returns `false` once the run is cancelled. A write that lost the race
    /// with `disconnect()` is corrected back to `Disconnected`.
    fn enter(&self, token: &CancellationToken, state: ConnectionState) -> bool {
        if token.is_cancelled() {
            return false;
        }
        self.set_state(state);
        if token.is_cancelled() {
            if self.run.lock().is_none() {
                self.set_state(ConnectionState::Disconnected);
            }
            return false;
        }
        true
    }

    fn arm_backoff(&self, generation: u64, skip: CancellationToken) -> bool {
        match self.run.lock().as_mut() {
            Some(run) if run.generation == generation => {
                run.backoff = Some(skip);
                true
            }
            _ => false,
        }
    }

    fn disarm_backoff(&self, generation: u64) {
        if let Some(run) = self.run.lock().as_mut() {
            if run.generation == generation {
                run.backoff = None;
            }
        }
    }

    /// Deliver inbound frames and send pings until the link closes.
    async fn pump(&self, mut incoming: mpsc::Receiver<String>, token: &CancellationToken) {
        let period = self.config.ping_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut visible_rx = self.visible_tx.subscribe();

        loop {
            let pinging = *visible_rx.borrow();

            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                frame = incoming.recv() => match frame {
                    Some(text) => self.deliver(&text),
                    None => return,
                },
                _ = ticker.tick(), if pinging => self.send_ping(),
                changed = visible_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    if *visible_rx.borrow_and_update() {
                        debug!("Foregrounded, resuming pings");
                        self.send_ping();
                        ticker.reset();
                    } else {
                        debug!("Backgrounded, pings suspended");
                    }
                }
            }
        }
    }

    fn deliver(&self, text: &str) {
        #[cfg(feature = "debug-tracing")]
        tracing::trace!(frame = %text, "inbound frame");

        let msg = match ServerMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping inbound frame: {}", e);
                return;
            }
        };

        let listeners: Vec<(u64, MessageListener)> = self.message_listeners.lock().clone();
        for (id, listener) in listeners {
            invoke_isolated(msg.kind().as_str(), id, || listener(&msg));
        }
    }

    fn send_ping(&self) {
        let t = self.latency.now_millis();
        self.latency.record_ping_sent(t);
        if let Err(e) = self.send(&ClientMessage::Ping { t: Some(t) }) {
            debug!("Ping not sent: {}", e);
        }
    }

    fn send(&self, msg: &ClientMessage) -> Result<(), ConnectionError> {
        let state = *self.state_tx.borrow();
        let link = self.link.lock().clone();

        let tx = match (state, link) {
            (ConnectionState::Open, Some(tx)) => tx,
            _ => {
                warn!("Dropping {} while {}", msg.type_name(), state.as_str());
                return Err(ConnectionError::NotConnected(state));
            }
        };

        let text = msg.encode()?;
        tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!("Dropping {}: outbound queue full", msg.type_name());
                ConnectionError::Backpressure
            }
            mpsc::error::TrySendError::Closed(_) => ConnectionError::NotConnected(state),
        })
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev == next {
            return;
        }
        debug!("Connection {} -> {}", prev.as_str(), next.as_str());

        let listeners: Vec<(u64, StateListener)> = self.state_listeners.lock().clone();
        for (id, listener) in listeners {
            invoke_isolated("state", id, || listener(next));
        }
    }

    fn release_run(&self, generation: u64) {
        let mut run = self.run.lock();
        if run.as_ref().is_some_and(|r| r.generation == generation) {
            *run = None;
        }
    }
}
