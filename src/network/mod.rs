//! Network Layer
//!
//! Transport ownership, wire protocol and message fan-out.
//! Nothing outside `connection` touches the socket.

pub mod auth;
pub mod connection;
pub mod protocol;
pub mod router;
pub mod transport;

pub use auth::{check_token, inspect_token, TokenClaims, TokenError};
pub use connection::{
    ConnectionError, ConnectionManager, ConnectionState, LatencyTracker, ListenerId,
};
pub use protocol::{
    ClientMessage, Entity, EntityId, EntityPatch, MessageKind, Player, PlayerRole,
    ProtocolError, ServerMessage, Session, SessionStatus, Tint,
};
pub use router::{MessageRouter, Subscription, Topic};
pub use transport::{Connector, TransportError, TransportLink, WsConnector};
