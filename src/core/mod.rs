//! Core primitives.
//!
//! Small building blocks shared by the network and sync layers: time,
//! reconnect backoff, single-resolution outcomes and entity hashing.

pub mod backoff;
pub mod clock;
pub mod hash;
pub mod once;

// Re-export core types
pub use backoff::ReconnectPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use hash::{compute_entities_hash, entities_checksum};
pub use once::OnceResolver;
