//! The active engine.
//!
//! One lock guards all engine state. Event stores keep their own locks and
//! are only ever taken while the engine lock is held or on their own, never
//! the other way round.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{ActiveConfig, InduceParams};
use crate::decomp::{Decomp, FudNode};
use crate::error::{ActiveError, Result};
use crate::frames::Frames;
use crate::history::{DenseSpec, Window};
use crate::kernel::{ModelKernel, MutualInfoKernel};
use crate::logging::{obj, v_str, v_u64, Domain, Logger, ProfileScope};
use crate::slices::SliceTable;
use crate::store::{DenseRow, DenseStore, SparseRow, SparseStore};
use crate::system::{ActiveSystem, VarBlock};
use crate::view::RowView;

/// Passed to the update callback once an event is in the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventApplied {
    pub event_id: u64,
    /// Every id consumed by this step, the applied one last.
    pub ids: Vec<u64>,
    pub row: usize,
    pub slice: u64,
}

pub type UpdateCallback = Box<dyn Fn(&EventApplied) -> anyhow::Result<()> + Send + Sync>;
/// Called with the induced slice and its population at the snapshot.
pub type InduceCallback = Box<dyn Fn(u64, usize) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub applied: usize,
    pub last_event: Option<u64>,
    /// Stopped because induction raised back-pressure.
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorePending {
    pub store: String,
    pub events: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveReport {
    pub name: String,
    pub history_size: usize,
    pub cursor: usize,
    pub overflow: bool,
    pub populated: usize,
    pub slices: usize,
    pub rules: usize,
    pub leaves: usize,
    pub eligible: usize,
    pub largest_slice: Option<u64>,
    pub largest_size: usize,
    pub in_progress: usize,
    pub last_event: Option<u64>,
    pub discontinuities: u64,
    pub path_len_max: usize,
    pub pending: Vec<StorePending>,
    pub terminated: bool,
    pub backpressure: bool,
}

/// Everything behind the engine lock.
#[derive(Debug, Clone)]
pub struct ActiveState {
    pub(crate) window: Window,
    pub(crate) slices: SliceTable,
    pub(crate) decomp: Decomp,
    pub(crate) frames: Frames,
    /// Ids already consumed, pruned to those still reachable in a store.
    pub(crate) updated: BTreeSet<u64>,
    /// Ids for derived variables of induced rules.
    pub(crate) var_block: VarBlock,
    pub(crate) slice_block: VarBlock,
    pub(crate) params: InduceParams,
    pub(crate) in_progress: BTreeSet<u64>,
    pub(crate) discontinuities: u64,
}

impl ActiveState {
    pub(crate) fn fresh(
        config: &ActiveConfig,
        params: InduceParams,
        dense: &[DenseSpec],
        sparse: usize,
        bits: u32,
    ) -> Result<Self> {
        let window = Window::new(config.history_size, dense, sparse)?;
        Ok(Self {
            slices: SliceTable::new(
                config.history_size,
                &params.thresholds,
                config.cache_cumulative,
                config.cache_transitions,
            ),
            frames: Frames::new(config.frames.clone(), config.history_size, bits),
            window,
            decomp: Decomp::new(),
            updated: BTreeSet::new(),
            var_block: VarBlock::default(),
            slice_block: VarBlock::default(),
            params,
            in_progress: BTreeSet::new(),
            discontinuities: 0,
        })
    }

    pub(crate) fn view(&self) -> RowView<'_> {
        RowView::new(&self.window, &self.frames, &self.decomp, self.slices.tags())
    }

    pub(crate) fn last_updated(&self) -> Option<u64> {
        self.updated.iter().next_back().copied()
    }
}

pub struct ActiveBuilder {
    config: ActiveConfig,
    params: InduceParams,
    system: Option<Arc<ActiveSystem>>,
    kernel: Option<Arc<dyn ModelKernel>>,
    log: Option<Logger>,
    terminate: Option<Arc<AtomicBool>>,
    dense: Vec<(Arc<DenseStore>, DenseSpec)>,
    sparse: Vec<Arc<SparseStore>>,
    sink: Option<Arc<SparseStore>>,
    on_update: Option<UpdateCallback>,
    on_induce: Option<InduceCallback>,
}

impl ActiveBuilder {
    pub fn new(config: ActiveConfig) -> Self {
        Self {
            config,
            params: InduceParams::default(),
            system: None,
            kernel: None,
            log: None,
            terminate: None,
            dense: Vec::new(),
            sparse: Vec::new(),
            sink: None,
            on_update: None,
            on_induce: None,
        }
    }

    pub fn params(mut self, params: InduceParams) -> Self {
        self.params = params.normalized();
        self
    }

    pub fn system(mut self, system: Arc<ActiveSystem>) -> Self {
        self.system = Some(system);
        self
    }

    pub fn kernel(mut self, kernel: Arc<dyn ModelKernel>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn logger(mut self, log: Logger) -> Self {
        self.log = Some(log);
        self
    }

    /// Share a terminate flag with other engines or a supervisor.
    pub fn terminate_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.terminate = Some(flag);
        self
    }

    /// Subscribe to a dense store whose rows have the given shape.
    pub fn dense(mut self, store: Arc<DenseStore>, spec: DenseSpec) -> Self {
        self.dense.push((store, spec));
        self
    }

    pub fn sparse(mut self, store: Arc<SparseStore>) -> Self {
        self.sparse.push(store);
        self
    }

    /// Publish each row's slice path to `store`.
    pub fn sink(mut self, store: Arc<SparseStore>) -> Self {
        self.sink = Some(store);
        self
    }

    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&EventApplied) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_update = Some(Box::new(f));
        self
    }

    pub fn on_induce<F>(mut self, f: F) -> Self
    where
        F: Fn(u64, usize) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_induce = Some(Box::new(f));
        self
    }

    /// Registers this engine as a consumer of every subscribed store.
    pub fn build(self) -> Result<Active> {
        let system = self
            .system
            .unwrap_or_else(|| Arc::new(ActiveSystem::new(self.config.bits)));
        let bits = system.bits();
        let specs: Vec<DenseSpec> = self.dense.iter().map(|(_, s)| s.clone()).collect();
        let state = ActiveState::fresh(&self.config, self.params, &specs, self.sparse.len(), bits)?;
        let dense_stores: Vec<Arc<DenseStore>> = self.dense.into_iter().map(|(s, _)| s).collect();
        for store in &dense_stores {
            store.add_reference();
        }
        for store in &self.sparse {
            store.add_reference();
        }
        Ok(Active {
            name: self.config.name.clone(),
            config: self.config,
            log: self.log.unwrap_or_default(),
            system,
            kernel: self.kernel.unwrap_or_else(|| Arc::new(MutualInfoKernel::default())),
            terminate: self.terminate.unwrap_or_default(),
            backpressure: AtomicBool::new(false),
            dense_specs: specs,
            dense_stores,
            sparse_stores: self.sparse,
            sink: self.sink,
            on_update: self.on_update,
            on_induce: self.on_induce,
            state: Mutex::new(state),
        })
    }
}

pub struct Active {
    pub(crate) name: String,
    pub(crate) config: ActiveConfig,
    pub(crate) log: Logger,
    pub(crate) system: Arc<ActiveSystem>,
    pub(crate) kernel: Arc<dyn ModelKernel>,
    pub(crate) terminate: Arc<AtomicBool>,
    pub(crate) backpressure: AtomicBool,
    pub(crate) dense_specs: Vec<DenseSpec>,
    pub(crate) dense_stores: Vec<Arc<DenseStore>>,
    pub(crate) sparse_stores: Vec<Arc<SparseStore>>,
    pub(crate) sink: Option<Arc<SparseStore>>,
    pub(crate) on_update: Option<UpdateCallback>,
    pub(crate) on_induce: Option<InduceCallback>,
    pub(crate) state: Mutex<ActiveState>,
}

impl std::fmt::Debug for Active {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Active")
            .field("name", &self.name)
            .field("kernel", &self.kernel.name())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        let consumed = std::mem::take(&mut self.state.get_mut().updated);
        for store in &self.dense_stores {
            store.unsubscribe(&consumed);
        }
        for store in &self.sparse_stores {
            store.unsubscribe(&consumed);
        }
    }
}

impl Active {
    pub fn builder(config: ActiveConfig) -> ActiveBuilder {
        ActiveBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ActiveConfig {
        &self.config
    }

    pub fn system(&self) -> &Arc<ActiveSystem> {
        &self.system
    }

    pub fn logger(&self) -> &Logger {
        &self.log
    }

    pub fn params(&self) -> InduceParams {
        self.state.lock().params.clone()
    }

    pub fn set_params(&self, params: InduceParams) {
        let params = params.normalized();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.slices.set_thresholds(&st.decomp, &params.thresholds);
        st.params = params;
    }

    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        self.terminate.clone()
    }

    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.backpressure.load(Ordering::SeqCst)
    }

    /// Log a failure; fatal ones also move the engine to its terminal state.
    pub(crate) fn fail(&self, domain: Domain, operation: &str, err: ActiveError) -> ActiveError {
        if err.is_fatal() {
            self.terminate.store(true, Ordering::SeqCst);
            self.log.fatal(domain, &self.name, operation, &err);
        } else {
            self.log.error(
                domain,
                operation,
                obj(&[("name", v_str(&self.name)), ("kind", v_str(err.kind())), ("msg", v_str(&err.to_string()))]),
            );
        }
        err
    }

    /// Window and store shapes agree.
    pub(crate) fn check_underlying(&self, st: &ActiveState) -> Result<()> {
        st.window.check()?;
        if st.window.dense().len() != self.dense_stores.len() || st.window.sparse().len() != self.sparse_stores.len() {
            return Err(ActiveError::Inconsistent(format!(
                "inconsistent underlying: {} dense and {} sparse stores for {} and {} histories",
                self.dense_stores.len(),
                self.sparse_stores.len(),
                st.window.dense().len(),
                st.window.sparse().len()
            )));
        }
        if st.slices.tags().len() != st.window.size() {
            return Err(ActiveError::Inconsistent(format!(
                "{} slice tags for a window of {}",
                st.slices.tags().len(),
                st.window.size()
            )));
        }
        Ok(())
    }

    /// Drain every admissible event. Returns once no event is admissible,
    /// the engine is terminated, or induction asks the pipeline to pause.
    pub fn update(&self) -> Result<UpdateSummary> {
        let mut summary = UpdateSummary::default();
        loop {
            if self.is_terminated() {
                break;
            }
            if self.is_paused() {
                summary.paused = true;
                break;
            }
            let step = {
                let mut st = self.state.lock();
                self.update_step(&mut st)
            };
            let applied = match step {
                Ok(Some(applied)) => applied,
                Ok(None) => break,
                Err(e) => return Err(self.fail(Domain::Ingest, "update", e)),
            };
            if let Some(cb) = &self.on_update {
                if let Err(e) = cb(&applied) {
                    return Err(self.fail(Domain::Ingest, "update", ActiveError::Callback(format!("{:#}", e))));
                }
            }
            summary.applied += 1;
            summary.last_event = Some(applied.event_id);
        }
        Ok(summary)
    }

    fn update_step(&self, st: &mut ActiveState) -> Result<Option<EventApplied>> {
        self.check_underlying(st)?;
        let mut pending: Option<BTreeSet<u64>> = None;
        for store in &self.dense_stores {
            let ids = store.pending(&st.updated, pending.as_ref());
            if ids.is_empty() {
                return Ok(None);
            }
            pending = Some(ids);
        }
        for store in &self.sparse_stores {
            let ids = store.pending(&st.updated, pending.as_ref());
            if ids.is_empty() {
                return Ok(None);
            }
            pending = Some(ids);
        }
        let pending = match pending {
            Some(p) => p,
            None => return Ok(None),
        };
        let last = st.last_updated();
        let next = match last {
            Some(l) => pending.range((Bound::Excluded(l), Bound::Unbounded)).next().copied(),
            None => pending.iter().next().copied(),
        };
        let event = match next {
            Some(e) => e,
            None => return Ok(None),
        };
        let _scope = if self.config.logging {
            ProfileScope::new(&self.log, "apply", &[("name", v_str(&self.name)), ("event_id", v_u64(event))])
        } else {
            ProfileScope::disabled(&self.log)
        };
        if self.config.continuity {
            if let Some(l) = last {
                if event != l.wrapping_add(1) {
                    st.discontinuities += 1;
                    self.log.debug(
                        Domain::Ingest,
                        "discontinuity",
                        obj(&[("name", v_str(&self.name)), ("after", v_u64(l)), ("event_id", v_u64(event))]),
                    );
                }
            }
        }

        // merge
        let dense = self
            .dense_stores
            .iter()
            .map(|s| lost(s.name(), event, s.get(event)))
            .collect::<Result<Vec<Arc<DenseRow>>>>()?;
        let sparse = self
            .sparse_stores
            .iter()
            .map(|s| lost(s.name(), event, s.get(event)))
            .collect::<Result<Vec<Arc<SparseRow>>>>()?;
        let dense_rows: Vec<&DenseRow> = dense.iter().map(|r| r.as_ref()).collect();
        let sparse_rows: Vec<&SparseRow> = sparse.iter().map(|r| r.as_ref()).collect();
        let replaced = st.window.replaces();
        let j = st.window.admit(&dense_rows, &sparse_rows)?;

        // classify
        let path = self.classify_path(st, j, 0);
        let slice = path.last().copied().unwrap_or(0);
        st.slices.admit(&st.window, &st.decomp, j, slice, replaced);
        st.frames.admit(&st.window, st.slices.tags(), j);

        // emit
        if let Some(sink) = &self.sink {
            let values = if path.is_empty() { vec![0] } else { path };
            sink.insert(event, SparseRow::new(values));
        }

        // retire
        let mut least = event;
        for store in &self.dense_stores {
            if let Some(first) = store.retire(event, &pending, &st.updated).first {
                least = least.min(first);
            }
        }
        for store in &self.sparse_stores {
            if let Some(first) = store.retire(event, &pending, &st.updated).first {
                least = least.min(first);
            }
        }
        let ids: Vec<u64> = pending.range(..=event).copied().collect();
        st.updated.extend(ids.iter().copied());
        // the latest id is >= least, so it always survives
        st.updated = st.updated.split_off(&least);

        if self.config.logging {
            self.log.info(
                Domain::Ingest,
                "applied",
                obj(&[
                    ("name", v_str(&self.name)),
                    ("event_id", v_u64(event)),
                    ("row", json!(j)),
                    ("slice", v_u64(slice)),
                    ("slice_size", json!(st.slices.size(slice))),
                ]),
            );
        }
        Ok(Some(EventApplied { event_id: event, ids, row: j, slice }))
    }

    /// Path below `start` that row `j` classifies to under the current tree.
    pub(crate) fn classify_path(&self, st: &ActiveState, j: usize, start: u64) -> Vec<u64> {
        let view = st.view();
        let lookup = view.lookup(j);
        let eval = |node: &FudNode| self.kernel.apply(&node.fud, &lookup, &node.derived);
        st.decomp.classify_from(start, &eval)
    }

    /// Leaf slice row `j` classifies to now. `None` for unpopulated rows.
    pub fn classify(&self, j: usize) -> Option<u64> {
        let st = self.state.lock();
        if !st.window.is_populated(j) {
            return None;
        }
        Some(self.classify_path(&st, j, 0).last().copied().unwrap_or(0))
    }

    pub fn history_size(&self) -> usize {
        self.state.lock().window.size()
    }

    pub fn history_overflow(&self) -> bool {
        self.state.lock().window.overflow()
    }

    /// Next row to be overwritten.
    pub fn history_event(&self) -> usize {
        self.state.lock().window.cursor()
    }

    pub fn last_event(&self) -> Option<u64> {
        self.state.lock().last_updated()
    }

    pub fn discontinuities(&self) -> u64 {
        self.state.lock().discontinuities
    }

    /// Slice tag of a populated row.
    pub fn slice_of(&self, j: usize) -> Option<u64> {
        let st = self.state.lock();
        st.window.is_populated(j).then(|| st.slices.tag(j))
    }

    pub fn members(&self, slice: u64) -> Vec<usize> {
        self.state
            .lock()
            .slices
            .members(slice)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn slice_size(&self, slice: u64) -> usize {
        self.state.lock().slices.size(slice)
    }

    /// Population including descendants, when the cumulative cache is on.
    pub fn cumulative_size(&self, slice: u64) -> Option<usize> {
        self.state.lock().slices.cumulative_size(slice)
    }

    /// Consecutive row pairs tagged (`from`, `to`), when the transition
    /// cache is on.
    pub fn transition_count(&self, from: u64, to: u64) -> Option<usize> {
        self.state.lock().slices.transition_count(from, to)
    }

    pub fn eligible(&self) -> Vec<u64> {
        self.state.lock().slices.eligible().iter().copied().collect()
    }

    pub fn failure(&self, slice: u64) -> Option<usize> {
        self.state.lock().slices.failures().get(&slice).copied()
    }

    pub fn leaves(&self) -> Vec<u64> {
        self.state.lock().decomp.leaves()
    }

    /// Children of `slice` in declaration order, remainder last.
    pub fn children(&self, slice: u64) -> Option<Vec<u64>> {
        self.state.lock().decomp.node(slice).map(|n| n.children())
    }

    pub fn path(&self, slice: u64) -> Vec<u64> {
        self.state.lock().decomp.path(slice)
    }

    pub fn slice_length(&self, slice: u64) -> usize {
        self.state.lock().decomp.length(slice)
    }

    pub fn rules(&self) -> usize {
        self.state.lock().decomp.len()
    }

    /// Leaves partition the populated rows and agree with the row tags.
    pub fn check_partition(&self) -> Result<()> {
        let st = self.state.lock();
        st.slices.check(&st.window)?;
        for (slice, _) in st.slices.populations() {
            if !st.decomp.is_leaf(slice) {
                return Err(ActiveError::Inconsistent(format!("rows held by non-leaf slice {}", slice)));
            }
        }
        Ok(())
    }

    pub fn report(&self) -> ActiveReport {
        let report = {
            let st = self.state.lock();
            let largest = st
                .slices
                .populations()
                .fold(None, |best: Option<(u64, usize)>, (s, n)| match best {
                    Some((b, m)) if m > n || (m == n && b < s) => best,
                    _ => Some((s, n)),
                });
            let mut pending: Vec<StorePending> = self
                .dense_stores
                .iter()
                .map(|s| StorePending { store: s.name().to_string(), events: s.len() })
                .collect();
            pending.extend(
                self.sparse_stores
                    .iter()
                    .map(|s| StorePending { store: s.name().to_string(), events: s.len() }),
            );
            ActiveReport {
                name: self.name.clone(),
                history_size: st.window.size(),
                cursor: st.window.cursor(),
                overflow: st.window.overflow(),
                populated: st.window.populated(),
                slices: st.decomp.slices().len(),
                rules: st.decomp.len(),
                leaves: st.decomp.leaves().len(),
                eligible: st.slices.eligible().len(),
                largest_slice: largest.map(|(s, _)| s),
                largest_size: largest.map_or(0, |(_, n)| n),
                in_progress: st.in_progress.len(),
                last_event: st.last_updated(),
                discontinuities: st.discontinuities,
                path_len_max: st.window.path_len_max(),
                pending,
                terminated: self.is_terminated(),
                backpressure: self.is_paused(),
            }
        };
        let fields = match serde_json::to_value(&report) {
            Ok(Value::Object(m)) => m,
            _ => Map::new(),
        };
        self.log.info(Domain::System, "report", fields);
        report
    }

    /// Back to an empty window and tree, clearing the terminal state.
    /// Store subscriptions and ids already handed out by the allocator are
    /// kept.
    pub fn reset(&self) -> Result<()> {
        let mut st = self.state.lock();
        let params = st.params.clone();
        *st = ActiveState::fresh(
            &self.config,
            params,
            &self.dense_specs,
            self.sparse_stores.len(),
            self.system.bits(),
        )?;
        self.backpressure.store(false, Ordering::SeqCst);
        self.terminate.store(false, Ordering::SeqCst);
        self.log.info(Domain::System, "reset", obj(&[("name", v_str(&self.name))]));
        Ok(())
    }
}

fn lost<P>(store: &str, id: u64, payload: Option<Arc<P>>) -> Result<Arc<P>> {
    payload.ok_or_else(|| ActiveError::LostEvent { store: store.to_string(), id })
}
