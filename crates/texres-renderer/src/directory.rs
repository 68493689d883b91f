//! Logical texture key to slot bindings.

use std::collections::HashMap;

use crate::pool::SlotRef;
use crate::texture::TextureKey;

/// Forward map plus a reverse index, so a slot is never bound to two keys.
#[derive(Debug, Default)]
pub struct CacheDirectory {
    entries: HashMap<TextureKey, SlotRef>,
    occupants: HashMap<SlotRef, TextureKey>,
}

impl CacheDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &TextureKey) -> Option<SlotRef> {
        self.entries.get(key).copied()
    }

    pub fn occupant(&self, slot: SlotRef) -> Option<TextureKey> {
        self.occupants.get(&slot).copied()
    }

    /// Bind `key` to `slot`. Whatever `slot` held before loses its entry,
    /// and so does any slot `key` was bound to. Returns the displaced key.
    pub fn bind(&mut self, key: TextureKey, slot: SlotRef) -> Option<TextureKey> {
        let displaced = self.unbind(slot);
        if let Some(old_slot) = self.entries.insert(key, slot) {
            self.occupants.remove(&old_slot);
        }
        self.occupants.insert(slot, key);
        displaced
    }

    /// Drop the entry pointing at `slot`, returning its key.
    pub fn unbind(&mut self, slot: SlotRef) -> Option<TextureKey> {
        let key = self.occupants.remove(&slot)?;
        self.entries.remove(&key);
        Some(key)
    }

    pub fn remove(&mut self, key: &TextureKey) -> Option<SlotRef> {
        let slot = self.entries.remove(key)?;
        self.occupants.remove(&slot);
        Some(slot)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.occupants.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TextureKey, &SlotRef)> {
        self.entries.iter()
    }

    /// Forward and reverse maps agree one-to-one.
    pub fn is_consistent(&self) -> bool {
        self.entries.len() == self.occupants.len()
            && self
                .entries
                .iter()
                .all(|(key, slot)| self.occupants.get(slot) == Some(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolId, SlotId};
    use crate::texture::DynamicFlags;

    fn slot(pool: u16, slot: u32) -> SlotRef {
        SlotRef { pool: PoolId(pool), slot: SlotId(slot) }
    }

    #[test]
    fn test_bind_and_lookup() {
        let mut dir = CacheDirectory::new();
        let a = TextureKey::plain(1);
        assert_eq!(dir.bind(a, slot(0, 0)), None);
        assert_eq!(dir.lookup(&a), Some(slot(0, 0)));
        assert_eq!(dir.occupant(slot(0, 0)), Some(a));
        assert!(dir.is_consistent());
    }

    #[test]
    fn test_bind_displaces_prior_occupant() {
        let mut dir = CacheDirectory::new();
        let a = TextureKey::plain(1);
        let b = TextureKey::plain(2);
        dir.bind(a, slot(0, 3));
        assert_eq!(dir.bind(b, slot(0, 3)), Some(a));
        assert_eq!(dir.lookup(&a), None);
        assert_eq!(dir.lookup(&b), Some(slot(0, 3)));
        assert_eq!(dir.len(), 1);
        assert!(dir.is_consistent());
    }

    #[test]
    fn test_rebinding_key_frees_old_slot() {
        let mut dir = CacheDirectory::new();
        let a = TextureKey::plain(1);
        dir.bind(a, slot(0, 0));
        dir.bind(a, slot(1, 0));
        assert_eq!(dir.occupant(slot(0, 0)), None);
        assert_eq!(dir.lookup(&a), Some(slot(1, 0)));
        assert!(dir.is_consistent());
    }

    #[test]
    fn test_flags_are_separate_entries() {
        let mut dir = CacheDirectory::new();
        let plain = TextureKey::new(5, DynamicFlags::empty());
        let masked = TextureKey::new(5, DynamicFlags::MASKED);
        dir.bind(plain, slot(0, 0));
        dir.bind(masked, slot(1, 0));
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.unbind(slot(0, 0)), Some(plain));
        assert_eq!(dir.lookup(&masked), Some(slot(1, 0)));
        assert_eq!(dir.remove(&masked), Some(slot(1, 0)));
        assert!(dir.is_empty());
    }
}
