//! Sync Client
//!
//! Service object that owns one connection, one router, the entity store and
//! the session coordinator, and wires them together:
//!
//! ```text
//! ConnectionManager ──on_message──▶ MessageRouter ──SNAPSHOT/DELTA──▶ EntityStateStore
//!        ▲                               │  └──GAME_STATE/PLAYER_*/ERROR──▶ SessionCoordinator
//!        │ REQUEST_SNAPSHOT (resync)     └──any──▶ external subscribers
//!        └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Consumers observe changes through [`SyncClient::events`] or subscribe to
//! raw messages with [`SyncClient::subscribe`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::network::connection::{
    ConnectionError, ConnectionManager, ConnectionState, LatencyTracker, ListenerId,
};
use crate::network::protocol::{ClientMessage, MessageKind, ServerMessage, Session};
use crate::network::router::{MessageRouter, Subscription, Topic};
use crate::network::transport::Connector;
use crate::sync::api::{NewSession, SessionApi};
use crate::sync::entities::{ApplyOutcome, EntityStateStore, EntityView, ResyncReason};
use crate::sync::session::{SessionCoordinator, SessionError};
use crate::SNAPSHOT_VERSION;

/// Capacity of the event channel. Slow receivers see `Lagged`.
const EVENT_CAPACITY: usize = 256;

/// Notable state changes.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Transport state changed.
    ConnectionChanged(ConnectionState),
    /// Entity set advanced to `seq`.
    EntitiesUpdated {
        /// Store sequence after the update.
        seq: u64,
    },
    /// Current session changed (`None` once left).
    SessionChanged(Option<Session>),
    /// A full snapshot was requested.
    ResyncRequested(ResyncReason),
}

/// One synchronized client.
pub struct SyncClient {
    connection: ConnectionManager,
    router: MessageRouter,
    store: Arc<Mutex<EntityStateStore>>,
    sessions: SessionCoordinator,
    events: broadcast::Sender<SyncEvent>,
    listeners: Vec<ListenerId>,
    store_subscriptions: Vec<Subscription>,
    shutdown: CancellationToken,
}

impl SyncClient {
    /// Build and wire a client. Must be called from within a tokio runtime.
    pub fn init(
        config: ClientConfig,
        api: Arc<dyn SessionApi>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self::with_clock(config, api, connector, Arc::new(SystemClock))
    }

    /// Like [`SyncClient::init`] with an explicit time source.
    pub fn with_clock(
        config: ClientConfig,
        api: Arc<dyn SessionApi>,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let user_id = config.resolved_user_id();
        let latency = LatencyTracker::new(clock);
        let connection = ConnectionManager::new(config.connection, connector, latency.clone());
        let router = MessageRouter::new(latency);
        let store = Arc::new(Mutex::new(EntityStateStore::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();

        let mut listeners = Vec::new();
        let feed = router.clone();
        listeners.push(connection.on_message(move |msg| {
            feed.dispatch(msg);
            Ok(())
        }));
        let state_events = events.clone();
        listeners.push(connection.on_state_change(move |state| {
            let _ = state_events.send(SyncEvent::ConnectionChanged(state));
            Ok(())
        }));

        let mut store_subscriptions: Vec<Subscription> = [MessageKind::Snapshot, MessageKind::Delta]
            .into_iter()
            .map(|kind| {
                let store = store.clone();
                let connection = connection.clone();
                let events = events.clone();
                router.subscribe(kind, move |msg| {
                    apply_entity_message(&store, &connection, &events, msg)
                })
            })
            .collect();
        store_subscriptions.push(router.subscribe(MessageKind::Hello, |msg| {
            if let ServerMessage::Hello { tick_rate, snapshot_version } = msg {
                info!(tick_rate, snapshot_version, "Server hello");
                if *snapshot_version != SNAPSHOT_VERSION {
                    warn!(
                        "Snapshot version {} differs from supported {}",
                        snapshot_version, SNAPSHOT_VERSION
                    );
                }
            }
            Ok(())
        }));

        let sessions = SessionCoordinator::new(
            api,
            connection.clone(),
            router.clone(),
            config.join,
            config.access_token,
            user_id,
        );
        spawn_session_events(&sessions, events.clone(), shutdown.clone());

        info!("Sync client initialized");
        Self {
            connection,
            router,
            store,
            sessions,
            events,
            listeners,
            store_subscriptions,
            shutdown,
        }
    }

    /// Open the connection without joining anything.
    pub fn connect(&self) {
        self.connection.connect();
    }

    /// Receive [`SyncEvent`]s from now on.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Subscribe to raw server messages.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, handler: F) -> Subscription
    where
        F: Fn(&ServerMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.router.subscribe(topic, handler)
    }

    /// Send a message; dropped unless connected.
    pub fn send(&self, msg: &ClientMessage) -> Result<(), ConnectionError> {
        self.connection.send(msg)
    }

    /// Current entity set.
    pub fn entities(&self) -> EntityView {
        self.store.lock().entities()
    }

    /// Sequence of the entity set, `None` until the first snapshot.
    pub fn entity_seq(&self) -> Option<u64> {
        self.store.lock().seq()
    }

    /// Latest round trip (ms).
    pub fn latency(&self) -> Option<u64> {
        self.connection.latency_ms()
    }

    /// Transport state.
    pub fn connection_status(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Underlying connection.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Session coordinator.
    pub fn sessions(&self) -> &SessionCoordinator {
        &self.sessions
    }

    /// See [`SessionCoordinator::join_session`].
    pub async fn join_session(&self, session_id: &str) -> Result<Session, SessionError> {
        self.sessions.join_session(session_id).await
    }

    /// See [`SessionCoordinator::leave_session`].
    pub fn leave_session(&self) -> bool {
        self.sessions.leave_session()
    }

    /// See [`SessionCoordinator::create_session`].
    pub async fn create_session(&self, data: &NewSession) -> Result<Session, SessionError> {
        self.sessions.create_session(data).await
    }

    /// Session the local user is in.
    pub fn current_session(&self) -> Option<Session> {
        self.sessions.current_session()
    }

    /// Whether the local user is the game master.
    pub fn is_gm(&self) -> bool {
        self.sessions.is_gm()
    }

    /// Whether the local user is a player.
    pub fn is_player(&self) -> bool {
        self.sessions.is_player()
    }

    /// Whether the local user is a spectator.
    pub fn is_spectator(&self) -> bool {
        self.sessions.is_spectator()
    }

    /// Suspend or resume liveness pings.
    pub fn set_backgrounded(&self, backgrounded: bool) {
        self.connection.set_backgrounded(backgrounded);
    }

    /// Disconnect and release every subscription and task.
    pub fn dispose(self) {
        self.shutdown.cancel();
        for sub in &self.store_subscriptions {
            sub.unsubscribe();
        }
        self.sessions.detach();
        for id in &self.listeners {
            self.connection.remove_listener(*id);
        }
        self.router.clear();
        self.connection.disconnect();
        info!("Sync client disposed");
    }
}

fn apply_entity_message(
    store: &Mutex<EntityStateStore>,
    connection: &ConnectionManager,
    events: &broadcast::Sender<SyncEvent>,
    msg: &ServerMessage,
) -> anyhow::Result<()> {
    let (outcome, request) = {
        let mut store = store.lock();
        let Some(outcome) = store.apply_message(msg) else {
            return Ok(());
        };
        let request = store.should_request_resync().then(|| store.seq());
        (outcome, request)
    };

    match outcome {
        ApplyOutcome::Applied { seq } => {
            let _ = events.send(SyncEvent::EntitiesUpdated { seq });
        }
        ApplyOutcome::ResyncNeeded(reason) => {
            let Some(last_seq) = request else {
                debug!(?reason, "resync already requested");
                return Ok(());
            };
            info!(?reason, ?last_seq, "Requesting snapshot");
            connection.send(&ClientMessage::RequestSnapshot { last_seq })?;
            let _ = events.send(SyncEvent::ResyncRequested(reason));
        }
    }
    Ok(())
}

fn spawn_session_events(
    sessions: &SessionCoordinator,
    events: broadcast::Sender<SyncEvent>,
    shutdown: CancellationToken,
) {
    let mut rx = sessions.session_receiver();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        warn!("session channel closed");
                        break;
                    }
                    let session = rx.borrow_and_update().clone();
                    let _ = events.send(SyncEvent::SessionChanged(session));
                }
            }
        }
    });
}
