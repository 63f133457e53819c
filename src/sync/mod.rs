//! Sync Layer
//!
//! Shared game state kept consistent on top of the network layer: the entity
//! set, the joined session and the client object that ties them together.

pub mod api;
pub mod client;
pub mod entities;
pub mod session;

pub use api::{ApiError, HttpSessionApi, NewSession, SessionApi};
pub use client::{SyncClient, SyncEvent};
pub use entities::{ApplyOutcome, EntityStateStore, EntityView, ResyncReason};
pub use session::{SessionCoordinator, SessionError, SessionSlot};
