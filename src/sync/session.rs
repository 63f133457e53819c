//! Session Coordinator
//!
//! Join, leave and create sessions, and keep the joined session's record
//! current from authoritative server messages.
//!
//! ## Join handshake
//!
//! ```text
//! HTTP authorize ─▶ ensure Open ─▶ AUTHENTICATE ─▶ JOIN_SESSION
//!   (reject: no WS)   (poll 100ms,    (+500ms grace)     │
//!                      5s limit)                         ▼
//!                              first of SESSION_JOINED | ERROR | 3s timeout
//! ```
//!
//! The three outcomes race through a [`OnceResolver`]; whichever lands first
//! wins and the other two become no-ops. Both temporary subscriptions are
//! removed when the join ends, including when its future is dropped.
//!
//! ## Leaving
//!
//! Leaving is optimistic: the session disappears from the public view at
//! once, but the record is held in [`SessionSlot::Leaving`] until the server
//! confirms (PLAYER_LEFT for us, or a GAME_STATE without us). An ERROR naming
//! the session instead restores it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::JoinConfig;
use crate::core::once::OnceResolver;
use crate::network::auth::{check_token, TokenError};
use crate::network::connection::{ConnectionError, ConnectionManager};
use crate::network::protocol::{ClientMessage, MessageKind, PlayerRole, ServerMessage, Session};
use crate::network::router::{MessageRouter, Subscription};
use crate::sync::api::{ApiError, NewSession, SessionApi};

/// Session errors. Timeouts are retryable.
#[derive(Debug, Error)]
pub enum SessionError {
    /// HTTP authorization refused the join.
    #[error("not authorized to join: {0}")]
    Authorization(String),

    /// Transport did not open in time.
    #[error("connection timeout")]
    ConnectionTimeout,

    /// No SESSION_JOINED or ERROR in time.
    #[error("join timeout")]
    JoinTimeout,

    /// Server answered the join with an ERROR.
    #[error("join rejected: {code}: {message}")]
    Rejected {
        /// Error code.
        code: String,
        /// Human-readable reason.
        message: String,
    },

    /// Another `join_session` call has not finished.
    #[error("a join is already in progress")]
    JoinInProgress,

    /// Could not send over the connection.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// HTTP call failed.
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Where the local user stands with respect to a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SessionSlot {
    /// Not in a session.
    #[default]
    Idle,
    /// In the session.
    Joined(Session),
    /// Leave sent, awaiting confirmation.
    Leaving(Session),
}

#[derive(Debug)]
enum JoinOutcome {
    Joined(Session),
    Rejected { code: String, message: String },
    TimedOut,
}

struct Inner {
    api: Arc<dyn SessionApi>,
    connection: ConnectionManager,
    router: MessageRouter,
    config: JoinConfig,
    access_token: Option<String>,
    user_id: Option<String>,
    slot: Mutex<SessionSlot>,
    joining: AtomicBool,
    view_tx: watch::Sender<Option<Session>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Clears the join-in-progress flag however the join ends.
struct JoinGuard<'a>(&'a AtomicBool);

impl Drop for JoinGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One-shot join subscriptions. Dropping it settles the resolver and
/// unsubscribes both handlers, including when the join future is dropped.
struct PendingJoin {
    resolver: Arc<OnceResolver<JoinOutcome>>,
    subscriptions: [Subscription; 2],
}

impl Drop for PendingJoin {
    fn drop(&mut self) {
        self.resolver.cancel();
        for sub in &self.subscriptions {
            sub.unsubscribe();
        }
    }
}

/// Session lifecycle over the HTTP API and the message connection.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    /// Create a coordinator and subscribe it to session messages on `router`.
    pub fn new(
        api: Arc<dyn SessionApi>,
        connection: ConnectionManager,
        router: MessageRouter,
        config: JoinConfig,
        access_token: Option<String>,
        user_id: Option<String>,
    ) -> Self {
        let (view_tx, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            api,
            connection,
            router: router.clone(),
            config,
            access_token,
            user_id,
            slot: Mutex::new(SessionSlot::Idle),
            joining: AtomicBool::new(false),
            view_tx,
            subscriptions: Mutex::new(Vec::new()),
        });

        let subscriptions = [
            MessageKind::SessionJoined,
            MessageKind::GameState,
            MessageKind::PlayerJoined,
            MessageKind::PlayerLeft,
            MessageKind::Error,
        ]
        .into_iter()
        .map(|kind| {
            let weak: Weak<Inner> = Arc::downgrade(&inner);
            router.subscribe(kind, move |msg| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_message(msg);
                }
                Ok(())
            })
        })
        .collect();
        *inner.subscriptions.lock() = subscriptions;

        Self { inner }
    }

    /// Join `session_id` and return its record.
    #[instrument(skip(self))]
    pub async fn join_session(&self, session_id: &str) -> Result<Session, SessionError> {
        if self.inner.joining.swap(true, Ordering::SeqCst) {
            return Err(SessionError::JoinInProgress);
        }
        let _guard = JoinGuard(&self.inner.joining);

        // HTTP first; a refusal never reaches the socket.
        if let Err(e) = self.inner.api.join_session(session_id).await {
            warn!("Join refused by API: {}", e);
            return Err(SessionError::Authorization(e.to_string()));
        }

        self.ensure_connected().await?;
        self.authenticate().await;

        let summary = match self.await_join(session_id).await? {
            JoinOutcome::Joined(session) => session,
            JoinOutcome::Rejected { code, message } => {
                warn!(code = %code, "Join rejected: {}", message);
                return Err(SessionError::Rejected { code, message });
            }
            JoinOutcome::TimedOut => {
                warn!("No join response within {:?}", self.inner.config.join_timeout);
                return Err(SessionError::JoinTimeout);
            }
        };

        let session = match self.inner.api.get_session(session_id).await {
            Ok(session) => session,
            Err(e) => {
                debug!("Falling back to joined summary: {}", e);
                summary
            }
        };

        info!(session = %session.id, players = session.players.len(), "Joined session");
        self.inner.set_slot(SessionSlot::Joined(session.clone()));
        Ok(session)
    }

    /// Leave the current session. Returns `false` if there was nothing to leave.
    pub fn leave_session(&self) -> bool {
        let mut slot = self.inner.slot.lock();
        let session = match std::mem::take(&mut *slot) {
            SessionSlot::Joined(session) => session,
            other => {
                *slot = other;
                return false;
            }
        };

        let sent = self.inner.connection.send(&ClientMessage::LeaveSession);
        match sent {
            Ok(()) => {
                info!(session = %session.id, "Leaving session");
                *slot = SessionSlot::Leaving(session);
            }
            Err(e) => {
                // Nobody to confirm; drop it now.
                debug!("Leave not sent ({}), leaving locally", e);
            }
        }
        drop(slot);
        self.inner.publish();
        true
    }

    /// Create a session through the API, then join it.
    #[instrument(skip(self, data), fields(name = %data.name))]
    pub async fn create_session(&self, data: &NewSession) -> Result<Session, SessionError> {
        let created = self.inner.api.create_session(data).await?;
        info!(session = %created.id, "Session created");
        self.join_session(&created.id).await
    }

    /// Session the local user is in. `None` while a leave is pending.
    pub fn current_session(&self) -> Option<Session> {
        match &*self.inner.slot.lock() {
            SessionSlot::Joined(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Full slot, including a pending leave.
    pub fn slot(&self) -> SessionSlot {
        self.inner.slot.lock().clone()
    }

    /// Receiver observing every change to [`SessionCoordinator::current_session`].
    pub fn session_receiver(&self) -> watch::Receiver<Option<Session>> {
        self.inner.view_tx.subscribe()
    }

    /// Local user id, if known.
    pub fn user_id(&self) -> Option<&str> {
        self.inner.user_id.as_deref()
    }

    /// Whether the local user runs the current session.
    pub fn is_gm(&self) -> bool {
        let Some(user) = self.user_id() else {
            return false;
        };
        self.current_session().is_some_and(|s| {
            s.gm_id == user || s.player(user).is_some_and(|p| p.role == PlayerRole::Gm)
        })
    }

    /// Whether the local user plays in the current session.
    pub fn is_player(&self) -> bool {
        self.local_role() == Some(PlayerRole::Player)
    }

    /// Whether the local user only watches the current session.
    pub fn is_spectator(&self) -> bool {
        self.local_role() == Some(PlayerRole::Spectator)
    }

    /// Remove the coordinator's router subscriptions.
    pub fn detach(&self) {
        for sub in self.inner.subscriptions.lock().drain(..) {
            sub.unsubscribe();
        }
    }

    fn local_role(&self) -> Option<PlayerRole> {
        let user = self.user_id()?;
        self.current_session()?.player(user).map(|p| p.role)
    }

    async fn ensure_connected(&self) -> Result<(), SessionError> {
        let connection = &self.inner.connection;
        if connection.is_connected() {
            return Ok(());
        }
        connection.connect();

        let deadline = Instant::now() + self.inner.config.connect_timeout;
        loop {
            if connection.is_connected() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("Connection not open after {:?}", self.inner.config.connect_timeout);
                return Err(SessionError::ConnectionTimeout);
            }
            sleep(self.inner.config.connect_poll_interval).await;
        }
    }

    async fn authenticate(&self) {
        let Some(token) = self.inner.access_token.as_deref() else {
            return;
        };
        if let Err(TokenError::Expired) = check_token(token) {
            warn!("Access token expired, skipping authentication");
            return;
        }

        let msg = ClientMessage::Authenticate { token: token.to_string() };
        if let Err(e) = self.inner.connection.send(&msg) {
            warn!("Failed to authenticate: {}", e);
            return;
        }
        sleep(self.inner.config.auth_grace).await;
    }

    async fn await_join(&self, session_id: &str) -> Result<JoinOutcome, SessionError> {
        let (resolver, receiver) = OnceResolver::new();

        let joined = {
            let resolver = resolver.clone();
            let target = session_id.to_string();
            self.inner.router.subscribe(MessageKind::SessionJoined, move |msg| {
                if let ServerMessage::SessionJoined { session } = msg {
                    if session.id == target {
                        resolver.resolve(JoinOutcome::Joined(session.clone()));
                    }
                }
                Ok(())
            })
        };
        let failed = {
            let resolver = resolver.clone();
            let target = session_id.to_string();
            self.inner.router.subscribe(MessageKind::Error, move |msg| {
                if let ServerMessage::Error { code, message, id } = msg {
                    if id.as_deref().map_or(true, |id| id == target) {
                        resolver.resolve(JoinOutcome::Rejected {
                            code: code.clone(),
                            message: message.clone(),
                        });
                    }
                }
                Ok(())
            })
        };

        let pending = PendingJoin { resolver, subscriptions: [joined, failed] };

        self.inner.connection.send(&ClientMessage::JoinSession {
            session_id: session_id.to_string(),
        })?;
        let outcome = pending
            .resolver
            .wait(receiver, self.inner.config.join_timeout, || JoinOutcome::TimedOut)
            .await
            .unwrap_or(JoinOutcome::TimedOut);

        drop(pending);
        Ok(outcome)
    }
}

impl Inner {
    fn set_slot(&self, slot: SessionSlot) {
        *self.slot.lock() = slot;
        self.publish();
    }

    fn publish(&self) {
        let view = match &*self.slot.lock() {
            SessionSlot::Joined(session) => Some(session.clone()),
            _ => None,
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }

    fn is_local(&self, player_id: &str) -> bool {
        self.user_id.as_deref() == Some(player_id)
    }

    fn handle_message(&self, msg: &ServerMessage) {
        let mut slot = self.slot.lock();
        let next = match (std::mem::take(&mut *slot), msg) {
            (
                SessionSlot::Joined(current) | SessionSlot::Leaving(current),
                ServerMessage::SessionJoined { session },
            ) if session.id == current.id => {
                debug!(session = %session.id, "Session record replaced");
                SessionSlot::Joined(session.clone())
            }
            (SessionSlot::Joined(mut session), ServerMessage::GameState { game_id, players, phase })
                if *game_id == session.id =>
            {
                session.players = players.clone();
                session.status = *phase;
                if players.iter().any(|p| self.is_local(&p.id)) || self.user_id.is_none() {
                    SessionSlot::Joined(session)
                } else {
                    info!(session = %session.id, "No longer in session roster");
                    SessionSlot::Idle
                }
            }
            (SessionSlot::Joined(mut session), ServerMessage::PlayerJoined { player }) => {
                session.players.retain(|p| p.id != player.id);
                session.players.push(player.clone());
                SessionSlot::Joined(session)
            }
            (SessionSlot::Joined(mut session), ServerMessage::PlayerLeft { player_id }) => {
                if self.is_local(player_id) {
                    info!(session = %session.id, "Removed from session");
                    SessionSlot::Idle
                } else {
                    session.players.retain(|p| p.id != *player_id);
                    SessionSlot::Joined(session)
                }
            }
            (SessionSlot::Leaving(session), ServerMessage::PlayerLeft { player_id })
                if self.is_local(player_id) =>
            {
                info!(session = %session.id, "Leave confirmed");
                SessionSlot::Idle
            }
            (SessionSlot::Leaving(session), ServerMessage::GameState { game_id, players, .. })
                if *game_id == session.id && !players.iter().any(|p| self.is_local(&p.id)) =>
            {
                info!(session = %session.id, "Leave confirmed by game state");
                SessionSlot::Idle
            }
            (SessionSlot::Leaving(session), ServerMessage::Error { id: Some(id), message, .. })
                if *id == session.id =>
            {
                warn!(session = %session.id, "Leave rejected, restoring session: {}", message);
                SessionSlot::Joined(session)
            }
            (unchanged, _) => unchanged,
        };
        *slot = next;
        drop(slot);
        self.publish();
    }
}
