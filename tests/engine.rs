//! End-to-end behaviour of the engine: ingestion, classification,
//! eligibility and induction, driven through the public API only.

use parking_lot::Mutex;
use std::sync::Arc;

use activeslice::history::DenseSpec;
use activeslice::kernel::StubKernel;
use activeslice::logging::{Logger, MemorySink};
use activeslice::{Active, ActiveConfig, DenseRow, DenseStore, InduceOutcome, InduceParams};

fn row(x: u8) -> DenseRow {
    DenseRow::new(vec![1], vec![4], vec![x])
}

fn build(size: usize, params: InduceParams, store: &Arc<DenseStore>) -> Active {
    Active::builder(ActiveConfig::default().with_history(size))
        .params(params)
        .kernel(Arc::new(StubKernel::new(1)))
        .logger(Logger::new(Arc::new(MemorySink::new())))
        .dense(store.clone(), DenseSpec::new(vec![1], vec![4]))
        .build()
        .unwrap()
}

fn feed(a: &Active, store: &DenseStore, first: u64, values: &[u8]) {
    for (k, x) in values.iter().enumerate() {
        store.insert(first + k as u64, row(*x));
    }
    a.update().unwrap();
}

/// Every populated row is in exactly one leaf and the leaves cover them all.
fn assert_partition(a: &Active) {
    a.check_partition().unwrap();
    let mut rows: Vec<usize> = a.leaves().into_iter().flat_map(|s| a.members(s)).collect();
    rows.sort_unstable();
    let populated = a.report().populated;
    assert_eq!(rows, (0..populated).collect::<Vec<_>>());
}

// ---------------------------------------------------------------------------
// Window of four, threshold two, split on the only variable
// ---------------------------------------------------------------------------

#[test]
fn four_rows_split_by_value() {
    let store = DenseStore::shared("dense0", 0);
    let a = build(4, InduceParams::default().with_thresholds(&[2]), &store);
    feed(&a, &store, 1, &[0, 1, 0, 1]);

    for j in 0..4 {
        assert_eq!(a.slice_of(j), Some(0));
    }
    assert!(!a.history_overflow());
    assert_eq!(a.history_event(), 0);

    let summary = a.induce_sync().unwrap();
    assert_eq!(summary.grown, 1);
    let children = a.children(0).unwrap();
    // cells in value order, remainder last
    let (zero, one) = (children[0], children[1]);
    assert_eq!(a.members(one), vec![1, 3]);
    assert_eq!(a.members(zero), vec![0, 2]);
    assert!(a.members(children[2]).is_empty());
    assert!(!a.history_overflow());
    assert_partition(&a);

    // the fifth event wraps
    feed(&a, &store, 5, &[1]);
    assert!(a.history_overflow());
    assert_eq!(a.history_event(), 1);
    assert_eq!(a.members(one), vec![0, 1, 3]);
    assert_eq!(a.members(zero), vec![2]);
    assert_partition(&a);
}

#[test]
fn classify_is_idempotent() {
    let store = DenseStore::shared("dense0", 0);
    let a = build(4, InduceParams::default().with_thresholds(&[2]), &store);
    feed(&a, &store, 1, &[2, 3, 2]);
    a.induce_sync().unwrap();
    for j in 0..3 {
        let first = a.classify(j);
        assert_eq!(a.classify(j), first);
        assert_eq!(first, a.slice_of(j));
    }
}

// ---------------------------------------------------------------------------
// Ingestion order and reference counting
// ---------------------------------------------------------------------------

#[test]
fn ids_applied_once_in_order() {
    let store = DenseStore::shared("dense0", 0);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let a = Active::builder(ActiveConfig::default().with_history(8))
        .kernel(Arc::new(StubKernel::new(1)))
        .logger(Logger::new(Arc::new(MemorySink::new())))
        .dense(store.clone(), DenseSpec::new(vec![1], vec![4]))
        .on_update(move |e| {
            log.lock().push(e.event_id);
            Ok(())
        })
        .build()
        .unwrap();

    for id in 1..=3 {
        store.insert(id, row(0));
        a.update().unwrap();
    }
    // nothing new: no re-application
    assert_eq!(a.update().unwrap().applied, 0);
    store.insert(5, row(0));
    a.update().unwrap();
    store.insert(3, row(1));
    store.insert(4, row(1));
    assert_eq!(a.update().unwrap().applied, 0);
    assert_eq!(*seen.lock(), vec![1, 2, 3, 5]);
    assert_eq!(a.last_event(), Some(5));
}

#[test]
fn event_erased_after_every_consumer() {
    let store = DenseStore::shared("dense0", 0);
    let a = build(4, InduceParams::default(), &store);
    let b = build(4, InduceParams::default(), &store);
    let c = build(4, InduceParams::default(), &store);
    assert_eq!(store.references(), 3);

    for id in 1..=3 {
        store.insert(id, row(1));
    }
    a.update().unwrap();
    assert_eq!(store.len(), 3);
    assert_eq!(store.refcount(1), Some(2));
    b.update().unwrap();
    assert_eq!(store.refcount(3), Some(1));
    c.update().unwrap();
    assert!(store.is_empty());
}

#[test]
fn intersection_across_stores() {
    let dense = DenseStore::shared("dense0", 0);
    let other = DenseStore::shared("dense1", 0);
    let a = Active::builder(ActiveConfig::default().with_history(4))
        .kernel(Arc::new(StubKernel::new(1)))
        .logger(Logger::new(Arc::new(MemorySink::new())))
        .dense(dense.clone(), DenseSpec::new(vec![1], vec![4]))
        .dense(other.clone(), DenseSpec::new(vec![2], vec![2]))
        .build()
        .unwrap();
    dense.insert(1, row(1));
    dense.insert(2, row(2));
    other.insert(2, DenseRow::new(vec![2], vec![2], vec![1]));
    let summary = a.update().unwrap();
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.last_event, Some(2));
    // id 1 never reached the second store, so this consumer keeps its hold
    assert_eq!(dense.ids(), vec![1]);
    assert!(other.is_empty());
    assert_eq!(a.last_event(), Some(2));
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

#[test]
fn eligibility_follows_population() {
    let store = DenseStore::shared("dense0", 0);
    let a = build(4, InduceParams::default().with_thresholds(&[3]), &store);
    feed(&a, &store, 1, &[1, 1]);
    assert!(a.eligible().is_empty());
    feed(&a, &store, 3, &[1]);
    assert_eq!(a.eligible(), vec![0]);
    feed(&a, &store, 4, &[0]);
    assert_eq!(a.eligible(), vec![0]);

    // the value-1 child is induced in the same pass and cannot split
    let summary = a.induce_sync().unwrap();
    assert_eq!((summary.grown, summary.failed), (1, 1));
    let children = a.children(0).unwrap();
    let (zero, one) = (children[0], children[1]);
    assert_eq!(a.slice_size(one), 3);
    assert_eq!(a.failure(one), Some(3));
    assert!(a.eligible().is_empty());

    // overwriting the oldest rows moves them from one child to the other
    feed(&a, &store, 5, &[0]);
    assert!(a.eligible().is_empty());
    feed(&a, &store, 6, &[0]);
    assert_eq!(a.slice_size(zero), 3);
    assert_eq!(a.eligible(), vec![zero]);
    feed(&a, &store, 7, &[1]);
    assert_eq!(a.eligible(), vec![zero]);
    feed(&a, &store, 8, &[1]);
    assert_eq!(a.slice_size(zero), 2);
    assert_eq!(a.slice_size(one), 2);
    assert!(a.eligible().is_empty());
    assert_partition(&a);
}

#[test]
fn failed_slice_waits_for_next_threshold() {
    let store = DenseStore::shared("dense0", 0);
    let a = build(8, InduceParams::default().with_thresholds(&[2, 5]), &store);
    feed(&a, &store, 1, &[3, 3]);
    let summary = a.induce_sync().unwrap();
    assert_eq!(summary.failed, 1);
    assert!(matches!(summary.outcomes[0], InduceOutcome::Failed { population: 2, reason: "no_candidates", .. }));
    assert_eq!(a.failure(0), Some(2));
    assert!(a.eligible().is_empty());
    feed(&a, &store, 3, &[3, 1]);
    assert!(a.eligible().is_empty());
    feed(&a, &store, 5, &[1]);
    assert_eq!(a.eligible(), vec![0]);
    assert_eq!(a.induce_sync().unwrap().grown, 1);
    assert_partition(&a);
}

// ---------------------------------------------------------------------------
// Induction scheduling
// ---------------------------------------------------------------------------

#[test]
fn async_induction_matches_sync() {
    let values: Vec<u8> = (0..16).map(|k| (k % 4) as u8).collect();
    let params = InduceParams { asynchronous: true, max_threads: 2, ..InduceParams::default() }.with_thresholds(&[2]);

    let store = DenseStore::shared("dense0", 0);
    let induced = Arc::new(Mutex::new(Vec::new()));
    let hook = induced.clone();
    let a = Arc::new(
        Active::builder(ActiveConfig::default().with_history(16))
            .params(params.clone())
            .kernel(Arc::new(StubKernel::new(1)))
            .logger(Logger::new(Arc::new(MemorySink::new())))
            .dense(store.clone(), DenseSpec::new(vec![1], vec![4]))
            .on_induce(move |slice, population| {
                hook.lock().push((slice, population));
                Ok(())
            })
            .build()
            .unwrap(),
    );
    feed(&a, &store, 1, &values);
    let summary = a.induce().unwrap();
    // the root splits four ways, then each child fails to split further
    assert_eq!(summary.grown, 1);
    assert_eq!(summary.failed, 4);
    assert!(!a.is_paused());
    assert!(a.eligible().is_empty());
    assert_eq!(*induced.lock(), vec![(0, 16)]);
    assert_partition(&a);

    let sync_store = DenseStore::shared("dense0", 0);
    let b = build(16, InduceParams { asynchronous: false, ..params }, &sync_store);
    feed(&b, &sync_store, 1, &values);
    b.induce_sync().unwrap();
    for j in 0..16 {
        let la = a.path(a.slice_of(j).unwrap()).len();
        let lb = b.path(b.slice_of(j).unwrap()).len();
        assert_eq!(la, lb);
        assert_eq!(a.members(a.slice_of(j).unwrap()).len(), 4);
    }
}

#[test]
fn terminate_stops_both_loops() {
    let store = DenseStore::shared("dense0", 0);
    let a = build(4, InduceParams::default().with_thresholds(&[1]), &store);
    a.terminate();
    store.insert(1, row(1));
    assert_eq!(a.update().unwrap().applied, 0);
    assert_eq!(a.induce_sync().unwrap().outcomes.len(), 0);
    assert_eq!(store.len(), 1);
}

#[test]
fn induce_callback_failure_is_fatal() {
    let store = DenseStore::shared("dense0", 0);
    let a = Active::builder(ActiveConfig::default().with_history(4))
        .params(InduceParams::default().with_thresholds(&[2]))
        .kernel(Arc::new(StubKernel::new(1)))
        .logger(Logger::new(Arc::new(MemorySink::new())))
        .dense(store.clone(), DenseSpec::new(vec![1], vec![4]))
        .on_induce(|_, _| anyhow::bail!("model registry unavailable"))
        .build()
        .unwrap();
    feed(&a, &store, 1, &[0, 1]);
    let err = a.induce_sync().unwrap_err();
    assert_eq!(err.kind(), "callback");
    assert!(a.is_terminated());
}
