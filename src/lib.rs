//! # Tabletop Sync
//!
//! Client-side synchronization layer for shared, server-authoritative tabletop
//! game state: entity transforms, the player roster and session status.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TABLETOP SYNC                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  config.rs       - Client/connection/join settings, env     │
//! │                                                              │
//! │  core/           - Primitives                                │
//! │  ├── clock.rs    - Millisecond time source                   │
//! │  ├── backoff.rs  - Reconnect delay policy                    │
//! │  ├── once.rs     - Single-resolution outcomes                │
//! │  └── hash.rs     - Entity set checksums                      │
//! │                                                              │
//! │  network/        - Transport and wire protocol               │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── transport.rs- WebSocket connector                       │
//! │  ├── connection.rs- Connection state machine, ping/latency   │
//! │  ├── router.rs   - Type-keyed message fan-out                │
//! │  └── auth.rs     - Access token inspection                   │
//! │                                                              │
//! │  sync/           - Shared state                              │
//! │  ├── entities.rs - Snapshot/delta entity store               │
//! │  ├── session.rs  - Join/leave handshake                      │
//! │  ├── api.rs      - Session HTTP API                          │
//! │  └── client.rs   - Wiring and events                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! The server is authoritative. The entity store only ever holds a state the
//! server produced: a delta that does not build on the store's sequence is
//! dropped whole and a fresh snapshot is requested.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod network;
pub mod sync;

// Re-export commonly used types
pub use config::{ClientConfig, ConnectionConfig, JoinConfig};
pub use network::{ClientMessage, ConnectionState, Entity, EntityId, ServerMessage, Session};
pub use sync::{SyncClient, SyncEvent};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Entity snapshot format version this client understands
pub const SNAPSHOT_VERSION: u32 = 1;
