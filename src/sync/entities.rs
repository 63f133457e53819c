//! Entity State Store
//!
//! Client copy of the server's entity set, advanced by snapshots and deltas.
//!
//! ## Sequencing
//!
//! `seq` is the sequence number of the last applied snapshot or delta. A delta
//! applies only when its `base_seq` equals `seq`; anything else means an update
//! was lost or reordered, so the delta is discarded whole and the store waits
//! for a fresh snapshot (resync).
//!
//! A delta that creates an id that already exists, or updates an id that does
//! not, is rejected the same way and never partially applied. Removing an id
//! that is already gone is a no-op: the end state is the same either way.
//!
//! Readers get an `Arc` view of the entity map; the store copies on write
//! when a view is still held, so views never observe a half-applied delta.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::hash::entities_checksum;
use crate::network::protocol::{Entity, EntityId, EntityPatch, ServerMessage};

/// Read-only view of the entity set.
pub type EntityView = Arc<BTreeMap<EntityId, Entity>>;

/// Why the store wants a fresh snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// No snapshot applied yet.
    NotSynced,
    /// Delta built on a different sequence than the store holds.
    StaleBase {
        /// Store sequence.
        expected: u64,
        /// Delta's base sequence.
        got: u64,
    },
    /// Delta creates an id the store already has.
    DuplicateEntity(EntityId),
    /// Delta updates an id the store does not have.
    UnknownEntity(EntityId),
    /// Applied state does not hash to the server's checksum.
    ChecksumMismatch,
}

/// Result of applying a snapshot or delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// State advanced to `seq`.
    Applied {
        /// New store sequence.
        seq: u64,
    },
    /// A fresh snapshot is needed. The store is unchanged, except for
    /// `ChecksumMismatch`, where the update was applied before the check.
    ResyncNeeded(ResyncReason),
}

impl ApplyOutcome {
    /// Whether the outcome asks for a resync.
    pub fn needs_resync(&self) -> bool {
        matches!(self, ApplyOutcome::ResyncNeeded(_))
    }
}

/// Snapshot/delta application producing a consistent entity set.
#[derive(Debug, Default)]
pub struct EntityStateStore {
    entities: EntityView,
    seq: Option<u64>,
    pending_resync: Option<ResyncReason>,
    resync_requested: bool,
}

impl EntityStateStore {
    /// Empty, unsynced store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence of the last applied update, `None` before the first snapshot.
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    /// Current entity set.
    pub fn entities(&self) -> EntityView {
        self.entities.clone()
    }

    /// Look up one entity.
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Entity count.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the store holds no entities.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Reason a resync is pending, if any.
    pub fn needs_resync(&self) -> Option<ResyncReason> {
        self.pending_resync
    }

    /// Returns `true` once per pending resync, so the request is sent only once
    /// until the next snapshot arrives.
    pub fn should_request_resync(&mut self) -> bool {
        if self.pending_resync.is_some() && !self.resync_requested {
            self.resync_requested = true;
            return true;
        }
        false
    }

    /// Hex checksum of the current entity set.
    pub fn state_hash(&self) -> String {
        entities_checksum(&self.entities)
    }

    /// Replace the whole entity set.
    pub fn apply_snapshot(&mut self, seq: u64, entities: Vec<Entity>) -> ApplyOutcome {
        let map: BTreeMap<EntityId, Entity> = entities.into_iter().map(|e| (e.id, e)).collect();
        debug!(seq, count = map.len(), "snapshot applied");

        self.entities = Arc::new(map);
        self.seq = Some(seq);
        self.pending_resync = None;
        self.resync_requested = false;
        ApplyOutcome::Applied { seq }
    }

    /// Apply an incremental change valid against `base_seq`.
    pub fn apply_delta(
        &mut self,
        seq: u64,
        base_seq: u64,
        created: Vec<Entity>,
        updated: Vec<EntityPatch>,
        removed: &[EntityId],
    ) -> ApplyOutcome {
        let current = match self.seq {
            Some(current) => current,
            None => return self.reject(ResyncReason::NotSynced),
        };
        if base_seq != current {
            return self.reject(ResyncReason::StaleBase { expected: current, got: base_seq });
        }

        // Validate everything before touching state.
        if let Some(dup) = created.iter().find(|e| self.entities.contains_key(&e.id)) {
            return self.reject(ResyncReason::DuplicateEntity(dup.id));
        }
        if let Some(unknown) = updated.iter().find(|p| !self.entities.contains_key(&p.id)) {
            return self.reject(ResyncReason::UnknownEntity(unknown.id));
        }

        let entities = Arc::make_mut(&mut self.entities);
        for entity in created {
            entities.insert(entity.id, entity);
        }
        for patch in &updated {
            if let Some(entity) = entities.get_mut(&patch.id) {
                patch.apply_to(entity);
            }
        }
        for id in removed {
            if entities.remove(id).is_none() {
                debug!(id, "removed entity already absent");
            }
        }

        self.seq = Some(seq);
        ApplyOutcome::Applied { seq }
    }

    /// Apply a SNAPSHOT or DELTA message, verifying its checksum if present.
    ///
    /// Returns `None` for message types the store does not consume.
    pub fn apply_message(&mut self, msg: &ServerMessage) -> Option<ApplyOutcome> {
        let (outcome, checksum) = match msg {
            ServerMessage::Snapshot { seq, entities, checksum } => {
                (self.apply_snapshot(*seq, entities.clone()), checksum)
            }
            ServerMessage::Delta { seq, base_seq, created, updated, removed, checksum } => (
                self.apply_delta(*seq, *base_seq, created.clone(), updated.clone(), removed),
                checksum,
            ),
            _ => return None,
        };

        if let (ApplyOutcome::Applied { seq }, Some(expected)) = (outcome, checksum) {
            let actual = self.state_hash();
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(seq, expected = %expected, actual = %actual, "entity checksum mismatch");
                self.pending_resync = Some(ResyncReason::ChecksumMismatch);
                return Some(ApplyOutcome::ResyncNeeded(ResyncReason::ChecksumMismatch));
            }
        }
        Some(outcome)
    }

    /// Drop all entities and forget the sequence, e.g. on leaving a session.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn reject(&mut self, reason: ResyncReason) -> ApplyOutcome {
        warn!(?reason, seq = ?self.seq, "delta rejected, resync needed");
        if self.pending_resync.is_none() {
            self.pending_resync = Some(reason);
        }
        ApplyOutcome::ResyncNeeded(reason)
    }
}
