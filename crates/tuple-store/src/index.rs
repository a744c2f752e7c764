//! Concurrent ordered tuple index
//!
//! An `OrderedIndex` maps tuples to a boxed payload, ordered by a search
//! order - a permutation of the key attributes that decides comparison
//! priority. Relational relations store the `NoValue` payload; lattice
//! relations store the lattice element. Tuples may carry extra trailing
//! attributes (provenance annotations) that never participate in the key.
//!
//! The backing store is an ordered map behind a reader-writer lock.
//! Insertions from concurrent workers are serialized by the lock; scans take
//! a read lock, and the parallel scan snapshots the entries and partitions
//! them across the rayon pool in `chunk`-sized leaf ranges.

use datalog_ast::Boxed;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::ops::Bound;

/// A tuple of unboxed attribute values.
pub type Tuple = Vec<i64>;

#[derive(Debug, Clone)]
struct Entry {
    /// Canonical tuple, including any non-key trailing attributes.
    tuple: Tuple,
    payload: Boxed,
}

/// Ordered map from key tuples to payloads, keyed by a search order.
#[derive(Debug)]
pub struct OrderedIndex {
    /// Permutation of `0..key_arity` giving the comparison priority.
    order: Vec<usize>,
    /// Leaf-range width handed to the worker pool by `par_for_each`.
    chunk: usize,
    map: RwLock<BTreeMap<Vec<i64>, Entry>>,
}

impl OrderedIndex {
    /// Create an index with the given search order. `chunk` is the fan-out
    /// of the backing tree and sizes the leaf ranges of parallel scans.
    pub fn new(order: Vec<usize>, chunk: usize) -> Self {
        debug_assert!(chunk > 0, "bug: zero index fan-out");
        OrderedIndex {
            order,
            chunk,
            map: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn key_arity(&self) -> usize {
        self.order.len()
    }

    fn key_of(&self, tuple: &[i64]) -> Vec<i64> {
        self.order.iter().map(|&col| tuple[col]).collect()
    }

    /// Insert a tuple; returns true when the key was absent.
    /// An existing entry is left untouched.
    pub fn put(&self, tuple: Tuple, payload: Boxed) -> bool {
        let key = self.key_of(&tuple);
        let mut map = self.map.write();
        match map.entry(key) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(Entry { tuple, payload });
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    /// Insert a tuple, combining payloads when the key exists.
    /// Returns true when the key was absent or the combined payload differs
    /// from the stored one.
    pub fn put_with<F>(&self, combine: F, tuple: Tuple, payload: Boxed) -> bool
    where
        F: Fn(&Boxed, &Boxed) -> Boxed,
    {
        let key = self.key_of(&tuple);
        let mut map = self.map.write();
        match map.entry(key) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(Entry { tuple, payload });
                true
            }
            std::collections::btree_map::Entry::Occupied(mut e) => {
                let combined = combine(&e.get().payload, &payload);
                let changed = combined != e.get().payload;
                e.get_mut().payload = combined;
                changed
            }
        }
    }

    /// Payload stored under the key attributes of `tuple`.
    pub fn get(&self, tuple: &[i64]) -> Option<Boxed> {
        let key = self.key_of(tuple);
        self.map.read().get(&key).map(|e| e.payload.clone())
    }

    /// Full stored tuple (with trailing attributes) under the key of `tuple`.
    pub fn get_tuple(&self, tuple: &[i64]) -> Option<(Tuple, Boxed)> {
        let key = self.key_of(tuple);
        self.map
            .read()
            .get(&key)
            .map(|e| (e.tuple.clone(), e.payload.clone()))
    }

    pub fn member_of(&self, tuple: &[i64]) -> bool {
        let key = self.key_of(tuple);
        self.map.read().contains_key(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    /// Visit every entry in key order.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Tuple, &Boxed),
    {
        let map = self.map.read();
        for entry in map.values() {
            visitor(&entry.tuple, &entry.payload);
        }
    }

    /// Visit every entry whose key lies within the inclusive bounds given in
    /// canonical attribute space (`lo[col] ..= hi[col]` per key attribute).
    pub fn range<F>(&self, lo: &[i64], hi: &[i64], mut visitor: F)
    where
        F: FnMut(&Tuple, &Boxed),
    {
        let lo_key: Vec<i64> = self.order.iter().map(|&col| lo[col]).collect();
        let hi_key: Vec<i64> = self.order.iter().map(|&col| hi[col]).collect();
        if lo_key > hi_key {
            return;
        }
        let map = self.map.read();
        for entry in map
            .range((Bound::Included(lo_key), Bound::Included(hi_key)))
            .map(|(_, e)| e)
        {
            // The ordered map bounds only constrain the leading attributes
            // lexicographically; trailing attributes must be re-checked.
            let inside = self
                .order
                .iter()
                .all(|&col| lo[col] <= entry.tuple[col] && entry.tuple[col] <= hi[col]);
            if inside {
                visitor(&entry.tuple, &entry.payload);
            }
        }
    }

    /// Visit every entry, partitioning leaf ranges across the worker pool.
    /// The snapshot taken at entry is consistent for the whole scan.
    pub fn par_for_each<F>(&self, visitor: F)
    where
        F: Fn(&Tuple, &Boxed) + Send + Sync,
    {
        let snapshot: Vec<Entry> = self.map.read().values().cloned().collect();
        snapshot.par_chunks(self.chunk).for_each(|leaf| {
            for entry in leaf {
                visitor(&entry.tuple, &entry.payload);
            }
        });
    }

    /// Read-only scan of `self` inserting every entry into `dst`.
    pub fn merge_into(&self, dst: &OrderedIndex) {
        let map = self.map.read();
        for entry in map.values() {
            dst.put(entry.tuple.clone(), entry.payload.clone());
        }
    }

    /// Like `merge_into` but combining payloads on collision.
    pub fn merge_with<F>(&self, combine: F, dst: &OrderedIndex)
    where
        F: Fn(&Boxed, &Boxed) -> Boxed,
    {
        let map = self.map.read();
        for entry in map.values() {
            dst.put_with(&combine, entry.tuple.clone(), entry.payload.clone());
        }
    }

    /// Exchange contents with another index of the same schema.
    pub fn swap_contents(&self, other: &OrderedIndex) {
        debug_assert_eq!(self.order, other.order, "bug: swapping unlike indexes");
        let mut a = self.map.write();
        let mut b = other.map.write();
        std::mem::swap(&mut *a, &mut *b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(order: Vec<usize>) -> OrderedIndex {
        OrderedIndex::new(order, 64)
    }

    #[test]
    fn test_put_and_get() {
        let index = idx(vec![0, 1]);
        assert!(index.put(vec![1, 2], Boxed::NoValue));
        assert!(!index.put(vec![1, 2], Boxed::NoValue));
        assert!(index.member_of(&[1, 2]));
        assert!(!index.member_of(&[2, 1]));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_put_with_combines() {
        let index = idx(vec![0]);
        let max = |a: &Boxed, b: &Boxed| if a >= b { a.clone() } else { b.clone() };
        assert!(index.put_with(max, vec![7], Boxed::Int64(3)));
        assert!(index.put_with(max, vec![7], Boxed::Int64(9)));
        // Joining a smaller value changes nothing.
        assert!(!index.put_with(max, vec![7], Boxed::Int64(5)));
        assert_eq!(index.get(&[7]), Some(Boxed::Int64(9)));
    }

    #[test]
    fn test_range_is_inclusive_both_ends() {
        let index = idx(vec![0, 1]);
        for a in 0..4 {
            for b in 0..4 {
                index.put(vec![a, b], Boxed::NoValue);
            }
        }
        let mut seen = Vec::new();
        index.range(&[1, i64::MIN], &[2, i64::MAX], |t, _| seen.push(t.clone()));
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|t| t[0] == 1 || t[0] == 2));
    }

    #[test]
    fn test_range_rechecks_trailing_attributes() {
        let index = idx(vec![0, 1]);
        index.put(vec![1, 5], Boxed::NoValue);
        index.put(vec![1, 9], Boxed::NoValue);
        index.put(vec![2, 1], Boxed::NoValue);
        let mut seen = Vec::new();
        index.range(&[1, 5], &[2, 6], |t, _| seen.push(t.clone()));
        // (1,9) falls inside the lexicographic span but outside the box.
        assert_eq!(seen, vec![vec![1, 5], vec![2, 1]]);
    }

    #[test]
    fn test_search_order_controls_iteration() {
        let index = idx(vec![1, 0]);
        index.put(vec![3, 1], Boxed::NoValue);
        index.put(vec![1, 2], Boxed::NoValue);
        let mut seen = Vec::new();
        index.for_each(|t, _| seen.push(t.clone()));
        // Ordered by attribute 1 first.
        assert_eq!(seen, vec![vec![3, 1], vec![1, 2]]);
    }

    #[test]
    fn test_merge_and_swap() {
        let src = idx(vec![0]);
        let dst = idx(vec![0]);
        src.put(vec![1], Boxed::NoValue);
        src.put(vec![2], Boxed::NoValue);
        dst.put(vec![2], Boxed::NoValue);
        src.merge_into(&dst);
        assert_eq!(dst.len(), 3);

        let other = idx(vec![0]);
        dst.swap_contents(&other);
        assert!(dst.is_empty());
        assert_eq!(other.len(), 3);
    }

    #[test]
    fn test_par_for_each_visits_everything() {
        let index = OrderedIndex::new(vec![0], 8);
        for i in 0..100 {
            index.put(vec![i], Boxed::NoValue);
        }
        let count = std::sync::atomic::AtomicUsize::new(0);
        index.par_for_each(|_, _| {
            count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        });
        assert_eq!(count.into_inner(), 100);
    }

    #[test]
    fn test_extra_trailing_attributes_stay_out_of_the_key() {
        // Two-column key, tuples carry a depth annotation in column 2.
        let index = idx(vec![0, 1]);
        assert!(index.put(vec![1, 2, 0], Boxed::NoValue));
        // Same fact at a different depth is not new.
        assert!(!index.put(vec![1, 2, 5], Boxed::NoValue));
        let (stored, _) = index.get_tuple(&[1, 2, 99]).unwrap();
        assert_eq!(stored, vec![1, 2, 0]);
    }
}
