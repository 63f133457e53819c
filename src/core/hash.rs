//! Entity Set Hashing
//!
//! Deterministic SHA-256 over an entity set, used to detect a silent desync
//! when the server attaches a checksum to a snapshot or delta.
//!
//! The digest covers entities in ascending id order. Floats are hashed by
//! their IEEE-754 bit pattern, so `-0.0` and `0.0` hash differently.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::network::protocol::{Entity, EntityId};

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Deterministic hasher for entity state.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for an entity set.
    pub fn for_entities() -> Self {
        Self::new(b"TABLETOP_SYNC_ENTITIES_V1")
    }

    /// Update with a u8 value.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an i32 value (little-endian).
    #[inline]
    pub fn update_i32(&mut self, value: i32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an f64 bit pattern.
    #[inline]
    pub fn update_f64(&mut self, value: f64) {
        self.update_u64(value.to_bits());
    }

    /// Update with a length-prefixed string.
    pub fn update_str(&mut self, value: &str) {
        self.update_u32(value.len() as u32);
        self.hasher.update(value.as_bytes());
    }

    /// Update with a presence byte followed by the value.
    fn update_opt<V>(&mut self, value: Option<V>, f: impl FnOnce(&mut Self, V)) {
        match value {
            Some(v) => {
                self.update_u8(1);
                f(self, v);
            }
            None => self.update_u8(0),
        }
    }

    /// Update with one entity.
    pub fn update_entity(&mut self, entity: &Entity) {
        self.update_u64(entity.id);
        self.update_f64(entity.x);
        self.update_f64(entity.y);
        self.update_f64(entity.rot);
        self.update_f64(entity.sx);
        self.update_f64(entity.sy);
        self.update_i32(entity.z_index);
        self.update_opt(entity.sprite.as_deref(), |h, s| h.update_str(s));
        self.update_opt(entity.tint, |h, t| {
            h.update_f64(t.r);
            h.update_f64(t.g);
            h.update_f64(t.b);
        });
        self.update_opt(entity.alpha, |h, a| h.update_f64(a));
        self.update_opt(entity.frame, |h, f| h.update_u32(f));
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Hash a full entity set.
pub fn compute_entities_hash(entities: &BTreeMap<EntityId, Entity>) -> StateHash {
    let mut hasher = StateHasher::for_entities();
    hasher.update_u32(entities.len() as u32);
    for entity in entities.values() {
        hasher.update_entity(entity);
    }
    hasher.finalize()
}

/// Hex form of [`compute_entities_hash`], as carried in `checksum` fields.
pub fn entities_checksum(entities: &BTreeMap<EntityId, Entity>) -> String {
    hex::encode(compute_entities_hash(entities))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[Entity]) -> BTreeMap<EntityId, Entity> {
        items.iter().map(|e| (e.id, e.clone())).collect()
    }

    #[test]
    fn test_hash_deterministic() {
        let entities = set(&[Entity::at(1, 0.5, -2.0), Entity::at(2, 10.0, 3.25)]);
        assert_eq!(compute_entities_hash(&entities), compute_entities_hash(&entities));
    }

    #[test]
    fn test_hash_changes_with_position() {
        let a = set(&[Entity::at(1, 0.0, 0.0)]);
        let b = set(&[Entity::at(1, 10.0, 0.0)]);
        assert_ne!(compute_entities_hash(&a), compute_entities_hash(&b));
    }

    #[test]
    fn test_hash_distinguishes_optional_hints() {
        let plain = Entity::at(1, 0.0, 0.0);
        let mut faded = plain.clone();
        faded.alpha = Some(0.5);

        assert_ne!(
            compute_entities_hash(&set(&[plain])),
            compute_entities_hash(&set(&[faded]))
        );
    }

    #[test]
    fn test_checksum_is_hex() {
        let checksum = entities_checksum(&BTreeMap::new());
        assert_eq!(checksum.len(), 64);
        assert!(checksum.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
