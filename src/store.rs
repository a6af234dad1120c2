//! Reference-counted event stores.
//!
//! One producer inserts events; each of the `references` registered
//! consumers releases an id once it has finished with it. An entry is erased
//! when its count reaches zero. Every map operation takes this store's own
//! lock and nothing else.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// One observation of a set of dense variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenseRow {
    pub vars: Vec<u64>,
    /// Valency of each variable; values are in `0..shape[i]`.
    pub shape: Vec<u16>,
    pub values: Vec<u8>,
}

impl DenseRow {
    pub fn new(vars: Vec<u64>, shape: Vec<u16>, values: Vec<u8>) -> Self {
        Self { vars, shape, values }
    }

    pub fn dimension(&self) -> usize {
        self.vars.len()
    }

    pub fn is_consistent(&self) -> bool {
        self.vars.len() == self.shape.len() && self.vars.len() == self.values.len()
    }
}

/// A sparse categorical observation. Nonzero entries run from the most
/// general category to the most specific; the last nonzero one is the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseRow {
    pub values: Vec<u64>,
}

impl SparseRow {
    pub fn new(values: Vec<u64>) -> Self {
        Self { values }
    }

    pub fn single(value: u64) -> Self {
        Self { values: vec![value] }
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// Last nonzero value, or 0.
    pub fn value(&self) -> u64 {
        self.values.iter().rev().copied().find(|v| *v != 0).unwrap_or(0)
    }

    /// Nonzero values strictly before the last nonzero one.
    pub fn ancestors(&self) -> Vec<u64> {
        let last = match self.values.iter().rposition(|v| *v != 0) {
            Some(i) => i,
            None => return Vec::new(),
        };
        self.values[..last].iter().copied().filter(|v| *v != 0).collect()
    }
}

#[derive(Debug)]
struct StoreInner<P> {
    references: u32,
    map: BTreeMap<u64, (Arc<P>, u32)>,
}

#[derive(Debug)]
pub struct EventStore<P> {
    name: String,
    inner: Mutex<StoreInner<P>>,
}

pub type DenseStore = EventStore<DenseRow>;
pub type SparseStore = EventStore<SparseRow>;

/// Outcome of releasing this consumer's hold on a range of ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Retired {
    /// Smallest id present before the release.
    pub first: Option<u64>,
    pub erased: usize,
}

impl<P> EventStore<P> {
    pub fn new(name: &str, references: u32) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(StoreInner {
                references,
                map: BTreeMap::new(),
            }),
        }
    }

    pub fn shared(name: &str, references: u32) -> Arc<Self> {
        Arc::new(Self::new(name, references))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn references(&self) -> u32 {
        self.inner.lock().references
    }

    /// Register one more consumer for events inserted from now on.
    pub fn add_reference(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.references += 1;
        inner.references
    }

    pub fn remove_reference(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.references = inner.references.saturating_sub(1);
        inner.references
    }

    /// Drop one consumer: stop counting it for new events and release its
    /// hold on every present id outside `consumed`. Returns the ids erased.
    pub fn unsubscribe(&self, consumed: &BTreeSet<u64>) -> usize {
        let mut inner = self.inner.lock();
        inner.references = inner.references.saturating_sub(1);
        let mut zero = Vec::new();
        for (id, (_, refs)) in inner.map.iter_mut() {
            if !consumed.contains(id) {
                *refs = refs.saturating_sub(1);
                if *refs == 0 {
                    zero.push(*id);
                }
            }
        }
        for id in &zero {
            inner.map.remove(id);
        }
        zero.len()
    }

    /// Insert with a count equal to the registered consumers. Without
    /// consumers the event is dropped and `false` returned.
    pub fn insert(&self, id: u64, payload: P) -> bool {
        self.insert_shared(id, Arc::new(payload))
    }

    pub fn insert_shared(&self, id: u64, payload: Arc<P>) -> bool {
        let mut inner = self.inner.lock();
        if inner.references == 0 {
            return false;
        }
        let refs = inner.references;
        inner.map.insert(id, (payload, refs));
        true
    }

    pub fn get(&self, id: u64) -> Option<Arc<P>> {
        self.inner.lock().map.get(&id).map(|(p, _)| p.clone())
    }

    pub fn refcount(&self, id: u64) -> Option<u32> {
        self.inner.lock().map.get(&id).map(|(_, r)| *r)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.inner.lock().map.keys().copied().collect()
    }

    pub fn first_id(&self) -> Option<u64> {
        self.inner.lock().map.keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// Ids present that are not in `updated` and, unless `first`, also in
    /// `within`.
    pub fn pending(&self, updated: &BTreeSet<u64>, within: Option<&BTreeSet<u64>>) -> BTreeSet<u64> {
        let inner = self.inner.lock();
        inner
            .map
            .keys()
            .filter(|id| !updated.contains(id) && within.map_or(true, |w| w.contains(id)))
            .copied()
            .collect()
    }

    /// Release one consumer's hold on a single id.
    pub fn release(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let erase = match inner.map.get_mut(&id) {
            Some((_, refs)) => {
                *refs = refs.saturating_sub(1);
                *refs == 0
            }
            None => return false,
        };
        if erase {
            inner.map.remove(&id);
        }
        true
    }

    /// Release every id `<= upto` that is in `candidates` and not in
    /// `updated`.
    pub fn retire(&self, upto: u64, candidates: &BTreeSet<u64>, updated: &BTreeSet<u64>) -> Retired {
        let mut inner = self.inner.lock();
        let first = inner.map.keys().next().copied();
        let mut zero = Vec::new();
        for (id, (_, refs)) in inner.map.range_mut(..=upto) {
            if candidates.contains(id) && !updated.contains(id) {
                *refs = refs.saturating_sub(1);
                if *refs == 0 {
                    zero.push(*id);
                }
            }
        }
        for id in &zero {
            inner.map.remove(id);
        }
        Retired { first, erased: zero.len() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_without_consumers_dropped() {
        let store: EventStore<SparseRow> = EventStore::new("s", 0);
        assert!(!store.insert(1, SparseRow::single(5)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_unsubscribe_releases_unconsumed() {
        let store: EventStore<SparseRow> = EventStore::new("s", 2);
        store.insert(1, SparseRow::single(5));
        store.insert(2, SparseRow::single(6));
        store.release(1);
        let consumed: BTreeSet<u64> = [1].into_iter().collect();
        assert_eq!(store.unsubscribe(&consumed), 0);
        assert_eq!(store.references(), 1);
        assert_eq!(store.refcount(1), Some(1));
        assert_eq!(store.refcount(2), Some(1));
        assert_eq!(store.unsubscribe(&BTreeSet::new()), 2);
        assert!(store.is_empty());
        assert!(!store.insert(3, SparseRow::single(7)));
    }

    #[test]
    fn test_erased_only_after_all_consumers() {
        let store: EventStore<SparseRow> = EventStore::new("s", 3);
        store.insert(1, SparseRow::single(5));
        assert!(store.release(1));
        assert!(store.release(1));
        assert_eq!(store.refcount(1), Some(1));
        assert!(store.release(1));
        assert!(store.get(1).is_none());
        assert!(!store.release(1));
    }

    #[test]
    fn test_retire_respects_candidates() {
        let store: EventStore<SparseRow> = EventStore::new("s", 1);
        for id in 1..=4 {
            store.insert(id, SparseRow::single(id));
        }
        let candidates: BTreeSet<u64> = [1, 2, 4].into_iter().collect();
        let updated: BTreeSet<u64> = [1].into_iter().collect();
        let r = store.retire(3, &candidates, &updated);
        assert_eq!(r.first, Some(1));
        assert_eq!(r.erased, 1);
        assert_eq!(store.ids(), vec![1, 3, 4]);
    }

    #[test]
    fn test_pending_intersection() {
        let store: EventStore<SparseRow> = EventStore::new("s", 1);
        for id in [2, 3, 5] {
            store.insert(id, SparseRow::single(1));
        }
        let updated: BTreeSet<u64> = [2].into_iter().collect();
        let within: BTreeSet<u64> = [3, 4].into_iter().collect();
        assert_eq!(store.pending(&updated, None).into_iter().collect::<Vec<_>>(), vec![3, 5]);
        assert_eq!(store.pending(&updated, Some(&within)).into_iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_sparse_value_and_ancestors() {
        let row = SparseRow::new(vec![7, 0, 9, 11, 0]);
        assert_eq!(row.value(), 11);
        assert_eq!(row.ancestors(), vec![7, 9]);
        assert_eq!(SparseRow::new(vec![0, 0]).value(), 0);
    }
}
