//! # Local Fragment Store
//!
//! Each peer keeps the fragments it is responsible for in an in-memory map
//! keyed by ring position, mirrored by a [`MerkleIndex`] over the key set.
//! Every present key appears in both; the index answers containment and
//! lets replicas compare key ranges by root hash.
//!
//! A key normally maps to a single fragment — one peer, one successor slot.
//! On a ring smaller than the replication degree a peer occupies several
//! successor slots of the same key and legitimately holds several
//! distinct-index fragments for it, so the map value is a small set of
//! fragments and a duplicate means same key *and* same fragment index.
//! Remote fragment creation still enforces one fragment per peer at the
//! handler level.

use std::collections::BTreeMap;
use std::fmt;

use crate::ida::DataFragment;
use crate::key::Key;
use crate::merkle::MerkleIndex;

/// Store-level failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key (or the exact fragment index under it) is already present.
    Duplicate(Key),
    /// The key is not present.
    NotFound(Key),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Duplicate(key) => write!(f, "key {key} already exists in store"),
            StoreError::NotFound(key) => write!(f, "key {key} does not exist in store"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Key → fragment mapping with a Merkle index over the keys.
#[derive(Default)]
pub struct FragmentStore {
    data: BTreeMap<Key, Vec<DataFragment>>,
    index: MerkleIndex,
}

impl FragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fragment under a key. Fails with [`StoreError::Duplicate`]
    /// when a fragment with the same index is already held under the key.
    pub fn insert(&mut self, key: Key, fragment: DataFragment) -> Result<(), StoreError> {
        match self.data.get_mut(&key) {
            Some(existing) => {
                if existing.iter().any(|held| held.index == fragment.index) {
                    return Err(StoreError::Duplicate(key));
                }
                existing.push(fragment);
            }
            None => {
                self.index.insert(key);
                self.data.insert(key, vec![fragment]);
            }
        }
        Ok(())
    }

    /// Replace the fragments held under an existing key.
    ///
    /// The replication protocol never updates in place (owners rotate out
    /// and would resurrect stale fragments); this is a store-level
    /// primitive kept for completeness and exercised only by tests.
    pub fn update(&mut self, key: Key, fragment: DataFragment) -> Result<(), StoreError> {
        match self.data.get_mut(&key) {
            Some(existing) => {
                *existing = vec![fragment];
                Ok(())
            }
            None => Err(StoreError::NotFound(key)),
        }
    }

    /// Remove a key and all fragments held under it.
    pub fn delete(&mut self, key: Key) -> Result<(), StoreError> {
        if !self.index.contains(key) {
            return Err(StoreError::NotFound(key));
        }
        self.index.delete(key);
        self.data.remove(&key);
        Ok(())
    }

    /// Fetch the fragments held under a key. The index answers presence
    /// first; the map supplies the payload.
    pub fn lookup(&self, key: Key) -> Result<&[DataFragment], StoreError> {
        if !self.index.contains(key) {
            return Err(StoreError::NotFound(key));
        }
        self.data
            .get(&key)
            .map(Vec::as_slice)
            .ok_or(StoreError::NotFound(key))
    }

    pub fn contains(&self, key: Key) -> bool {
        self.index.contains(key)
    }

    /// Every entry whose key falls inside the clockwise range
    /// `[lower, upper]` inclusive. Linear over the map; callers only scan
    /// their own owning range.
    pub fn read_range(&self, lower: Key, upper: Key) -> Vec<(Key, Vec<DataFragment>)> {
        self.data
            .iter()
            .filter(|(key, _)| key.in_between(lower, upper, true))
            .map(|(key, fragments)| (*key, fragments.clone()))
            .collect()
    }

    /// First key strictly greater than `key`, wrapping to the smallest
    /// stored key past the top of the ring. `None` on an empty store.
    pub fn next_key(&self, key: Key) -> Option<Key> {
        self.data
            .range((std::ops::Bound::Excluded(key), std::ops::Bound::Unbounded))
            .next()
            .or_else(|| self.data.iter().next())
            .map(|(next, _)| *next)
    }

    pub fn keys(&self) -> Vec<Key> {
        self.data.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Root hash of the key index, for replica comparison.
    pub fn root_hash(&self) -> Option<Key> {
        self.index.root_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ida::DataBlock;

    fn block() -> DataBlock {
        DataBlock::from_text("store test value", false).unwrap()
    }

    #[test]
    fn insert_then_lookup() {
        let mut store = FragmentStore::new();
        let block = block();
        let key = Key::hash("k1");

        store.insert(key, block.fragments()[0].clone()).unwrap();
        let held = store.lookup(key).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0], block.fragments()[0]);
        assert!(store.contains(key));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn duplicate_index_rejected_distinct_index_accepted() {
        let mut store = FragmentStore::new();
        let block = block();
        let key = Key::hash("k1");

        store.insert(key, block.fragments()[0].clone()).unwrap();
        assert_eq!(
            store.insert(key, block.fragments()[0].clone()),
            Err(StoreError::Duplicate(key))
        );

        // A different fragment index of the same key is a separate
        // successor slot, not a duplicate.
        store.insert(key, block.fragments()[1].clone()).unwrap();
        assert_eq!(store.lookup(key).unwrap().len(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn lookup_and_delete_missing_keys() {
        let mut store = FragmentStore::new();
        let key = Key::hash("absent");
        assert_eq!(store.lookup(key).err(), Some(StoreError::NotFound(key)));
        assert_eq!(store.delete(key), Err(StoreError::NotFound(key)));
        assert!(!store.contains(key));
    }

    #[test]
    fn delete_removes_key_and_index_entry() {
        let mut store = FragmentStore::new();
        let block = block();
        let key_a = Key::hash("a");
        let key_b = Key::hash("b");

        store.insert(key_a, block.fragments()[0].clone()).unwrap();
        store.insert(key_b, block.fragments()[1].clone()).unwrap();

        store.delete(key_a).unwrap();
        assert!(!store.contains(key_a));
        assert!(store.contains(key_b));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_requires_existing_key() {
        let mut store = FragmentStore::new();
        let block = block();
        let key = Key::hash("k");

        assert_eq!(
            store.update(key, block.fragments()[0].clone()),
            Err(StoreError::NotFound(key))
        );

        store.insert(key, block.fragments()[0].clone()).unwrap();
        store.update(key, block.fragments()[3].clone()).unwrap();
        let held = store.lookup(key).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].index, 4);
    }

    #[test]
    fn read_range_respects_the_ring() {
        let mut store = FragmentStore::new();
        let block = block();
        for (i, value) in [10u128, 20, 30, 200].iter().enumerate() {
            store
                .insert(Key::from(*value), block.fragments()[i].clone())
                .unwrap();
        }

        let plain: Vec<Key> = store
            .read_range(Key::from(15), Key::from(35))
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(plain, vec![Key::from(20), Key::from(30)]);

        // A wrapped range picks up both ends of the ring.
        let wrapped: Vec<Key> = store
            .read_range(Key::from(100), Key::from(15))
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(wrapped, vec![Key::from(10), Key::from(200)]);
    }

    #[test]
    fn next_key_wraps_around() {
        let mut store = FragmentStore::new();
        assert_eq!(store.next_key(Key::from(0)), None);

        let block = block();
        for (i, value) in [10u128, 20, 30].iter().enumerate() {
            store
                .insert(Key::from(*value), block.fragments()[i].clone())
                .unwrap();
        }

        assert_eq!(store.next_key(Key::from(10)), Some(Key::from(20)));
        assert_eq!(store.next_key(Key::from(25)), Some(Key::from(30)));
        assert_eq!(store.next_key(Key::from(30)), Some(Key::from(10)));
    }

    #[test]
    fn root_hash_tracks_the_key_set() {
        let mut store_a = FragmentStore::new();
        let mut store_b = FragmentStore::new();
        let block = block();
        let keys = [Key::hash("x"), Key::hash("y"), Key::hash("z")];

        for (i, &key) in keys.iter().enumerate() {
            store_a.insert(key, block.fragments()[i].clone()).unwrap();
        }
        for (i, &key) in keys.iter().rev().enumerate() {
            store_b.insert(key, block.fragments()[i].clone()).unwrap();
        }

        // Same key set, different insertion order and fragments: the index
        // only covers keys, so the roots agree.
        assert_eq!(store_a.root_hash(), store_b.root_hash());
        assert!(store_a.root_hash().is_some());
    }
}
