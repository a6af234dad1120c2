//! Induction scheduling: pick the largest eligible slice, select features,
//! layer a rule over them and grow the tree.
//!
//! Each slice goes through three phases. The snapshot copies candidate
//! feature columns for the slice's rows under the engine lock. Selection and
//! layering then run unlocked on that copy. Integration takes the lock again
//! to rename the rule's variables, grow the tree and reclassify the rows.

use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::active::{Active, ActiveState};
use crate::config::InduceParams;
use crate::decomp::{Cell, FudNode};
use crate::error::{ActiveError, Result};
use crate::frames::FrameKind;
use crate::kernel::{binary_entropy, rename_map, Layered, Selection};
use crate::logging::{obj, v_num, v_str, v_u64, Domain, ProfileScope};
use crate::variable::{is_computed, valency_bits, Variable};

#[derive(Debug, Clone, PartialEq)]
pub enum InduceOutcome {
    Grown {
        slice: u64,
        population: usize,
        children: Vec<u64>,
        /// Rows admitted to the slice after the snapshot.
        late: usize,
    },
    Failed {
        slice: u64,
        population: usize,
        reason: &'static str,
    },
}

impl InduceOutcome {
    pub fn slice(&self) -> u64 {
        match self {
            InduceOutcome::Grown { slice, .. } | InduceOutcome::Failed { slice, .. } => *slice,
        }
    }

    pub fn is_grown(&self) -> bool {
        matches!(self, InduceOutcome::Grown { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InduceSummary {
    pub grown: usize,
    pub failed: usize,
    pub outcomes: Vec<InduceOutcome>,
}

impl InduceSummary {
    fn record(&mut self, outcome: InduceOutcome) {
        if outcome.is_grown() {
            self.grown += 1;
        } else {
            self.failed += 1;
        }
        self.outcomes.push(outcome);
    }
}

/// Private copy of one slice's candidate features.
struct Snapshot {
    slice: u64,
    rows: Vec<usize>,
    candidates: Selection,
    /// Candidates that are 0/1 presence indicators.
    presence: HashSet<u64>,
    /// Every candidate ancestor of each presence candidate.
    ancestors: HashMap<u64, Vec<u64>>,
    params: InduceParams,
}

enum Layering {
    Found { layered: Layered, outputs: Vec<u64>, density: f64 },
    Failed(&'static str),
}

impl Active {
    /// Induce until no eligible slice is left, on this thread or across the
    /// worker pool depending on the parameters.
    pub fn induce(self: &Arc<Self>) -> Result<InduceSummary> {
        if self.params().asynchronous {
            self.induce_async()
        } else {
            self.induce_sync()
        }
    }

    pub fn induce_sync(&self) -> Result<InduceSummary> {
        let mut summary = InduceSummary::default();
        loop {
            if self.is_terminated() {
                break;
            }
            let picked = {
                let mut st = self.state.lock();
                let pick = st.slices.largest_eligible(&st.in_progress);
                if let Some((slice, _)) = pick {
                    st.in_progress.insert(slice);
                }
                pick
            };
            let slice = match picked {
                Some((slice, _)) => slice,
                None => break,
            };
            let outcome = self.induce_slice(slice);
            self.state.lock().in_progress.remove(&slice);
            summary.record(outcome?);
        }
        Ok(summary)
    }

    fn induce_async(self: &Arc<Self>) -> Result<InduceSummary> {
        let params = self.params();
        let cap = params.max_threads.max(1);
        let poll = Duration::from_millis(params.poll_interval_ms.max(1));
        let mut workers: Vec<(u64, JoinHandle<Result<InduceOutcome>>)> = Vec::new();
        let mut summary = InduceSummary::default();
        let mut fatal: Option<ActiveError> = None;
        loop {
            let mut i = 0;
            while i < workers.len() {
                if workers[i].1.is_finished() {
                    let (slice, handle) = workers.swap_remove(i);
                    if let Err(e) = self.reap(slice, handle, &mut summary) {
                        fatal.get_or_insert(e);
                    }
                } else {
                    i += 1;
                }
            }
            if fatal.is_some() || self.is_terminated() {
                break;
            }
            let picked = {
                let mut st = self.state.lock();
                let pick = if workers.len() < cap {
                    st.slices.largest_eligible(&st.in_progress)
                } else {
                    None
                };
                if let Some((slice, _)) = pick {
                    st.in_progress.insert(slice);
                }
                self.refresh_backpressure(&st, workers.len() + pick.is_some() as usize, cap, &params);
                pick
            };
            match picked {
                Some((slice, population)) => {
                    let engine = Arc::clone(self);
                    let spawned = thread::Builder::new()
                        .name(format!("induce-{}", slice))
                        .spawn(move || engine.induce_slice(slice));
                    match spawned {
                        Ok(handle) => {
                            self.log.debug(
                                Domain::Induce,
                                "worker_started",
                                obj(&[("name", v_str(&self.name)), ("slice", v_u64(slice)), ("population", json!(population))]),
                            );
                            workers.push((slice, handle));
                        }
                        Err(e) => {
                            self.state.lock().in_progress.remove(&slice);
                            fatal.get_or_insert(self.fail(Domain::Induce, "induce", ActiveError::Io(e)));
                            break;
                        }
                    }
                }
                None if workers.is_empty() => break,
                None => thread::sleep(poll),
            }
        }
        for (slice, handle) in workers.drain(..) {
            if let Err(e) = self.reap(slice, handle, &mut summary) {
                fatal.get_or_insert(e);
            }
        }
        self.backpressure.store(false, Ordering::SeqCst);
        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn reap(&self, slice: u64, handle: JoinHandle<Result<InduceOutcome>>, summary: &mut InduceSummary) -> Result<()> {
        let joined = handle.join();
        self.state.lock().in_progress.remove(&slice);
        match joined {
            Ok(Ok(outcome)) => {
                summary.record(outcome);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.fail(
                Domain::Induce,
                "induce",
                ActiveError::Inconsistent(format!("induction worker for slice {} panicked", slice)),
            )),
        }
    }

    /// Pause the update pipeline while the pool is saturated or a slice
    /// larger than the limit is being induced.
    fn refresh_backpressure(&self, st: &ActiveState, running: usize, cap: usize, params: &InduceParams) {
        let saturated = running >= cap;
        let oversized = params.slice_update_limit > 0
            && st
                .in_progress
                .iter()
                .any(|s| st.slices.size(*s) > params.slice_update_limit);
        let on = saturated || oversized;
        if self.backpressure.swap(on, Ordering::SeqCst) != on {
            self.log.debug(
                Domain::Induce,
                "backpressure",
                obj(&[("name", v_str(&self.name)), ("on", json!(on)), ("running", json!(running))]),
            );
        }
    }

    /// Run all three phases for one slice. Fatal errors are logged and move
    /// the engine to its terminal state before they are returned.
    pub(crate) fn induce_slice(&self, slice: u64) -> Result<InduceOutcome> {
        let started = Instant::now();
        let _scope = if self.config.logging {
            ProfileScope::new(&self.log, "induce", &[("name", v_str(&self.name)), ("slice", v_u64(slice))])
        } else {
            ProfileScope::disabled(&self.log)
        };
        let outcome = self.induce_phases(slice).map_err(|e| self.fail(Domain::Induce, "induce", e))?;
        match &outcome {
            InduceOutcome::Grown { population, children, late, .. } => {
                if self.config.logging {
                    self.log.info(
                        Domain::Induce,
                        "induced",
                        obj(&[
                            ("name", v_str(&self.name)),
                            ("slice", v_u64(slice)),
                            ("population", json!(population)),
                            ("children", json!(children.len())),
                            ("late", json!(late)),
                            ("elapsed_ms", v_num(started.elapsed().as_secs_f64() * 1000.0)),
                        ]),
                    );
                }
                if let Some(cb) = &self.on_induce {
                    if let Err(e) = cb(slice, *population) {
                        return Err(self.fail(Domain::Induce, "induce", ActiveError::Callback(format!("{:#}", e))));
                    }
                }
            }
            InduceOutcome::Failed { population, reason, .. } => {
                self.log.debug(
                    Domain::Induce,
                    "induce_failed",
                    obj(&[
                        ("name", v_str(&self.name)),
                        ("slice", v_u64(slice)),
                        ("population", json!(population)),
                        ("reason", v_str(reason)),
                    ]),
                );
            }
        }
        Ok(outcome)
    }

    fn induce_phases(&self, slice: u64) -> Result<InduceOutcome> {
        let snapshot = {
            let mut st = self.state.lock();
            self.check_underlying(&st)?;
            self.snapshot(&mut st, slice)?
        };
        let population = snapshot.rows.len();
        match self.layer(&snapshot)? {
            Layering::Found { layered, outputs, density } => {
                let mut st = self.state.lock();
                if density < snapshot.params.density_min {
                    return Ok(self.failed(&mut st, slice, population, "density"));
                }
                self.integrate(&mut st, &snapshot, layered, outputs)
            }
            Layering::Failed(reason) => {
                let mut st = self.state.lock();
                Ok(self.failed(&mut st, slice, population, reason))
            }
        }
    }

    fn failed(&self, st: &mut ActiveState, slice: u64, population: usize, reason: &'static str) -> InduceOutcome {
        st.slices.record_failure(&st.decomp, slice, population);
        InduceOutcome::Failed { slice, population, reason }
    }

    /// Copy every candidate feature column for the slice's rows.
    fn snapshot(&self, st: &mut ActiveState, slice: u64) -> Result<Snapshot> {
        if !st.decomp.is_leaf(slice) {
            return Err(ActiveError::Inconsistent(format!("slice {} is not a leaf", slice)));
        }
        let rows: Vec<usize> = st
            .slices
            .members(slice)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        let params = st.params.clone();
        let mut wanted: BTreeMap<u64, u16> = BTreeMap::new();
        let mut presence: HashSet<u64> = HashSet::new();
        // direct ancestor of each presence candidate
        let mut parent: HashMap<u64, u64> = HashMap::new();

        let mut underlying_lags = vec![0];
        underlying_lags.extend(st.frames.config.underlying.iter().copied());
        let history_lags = st.frames.config.history.clone();

        for lag in &underlying_lags {
            let lag = *lag;
            let lagged: Vec<Option<usize>> =
                rows.iter().map(|j| st.frames.lagged_row(&st.window, *j, lag)).collect();
            let dense: Vec<(u64, u16)> = st
                .window
                .dense()
                .iter()
                .flat_map(|hr| hr.vars().iter().copied().zip(hr.shape().iter().copied()))
                .filter(|(v, _)| !params.exclusions.contains(v))
                .collect();
            for (var, valency) in dense {
                let id = st.frames.promote(&self.system, FrameKind::Underlying, lag, var)?;
                wanted.insert(id, valency);
                if !params.computed.contains(&var) {
                    continue;
                }
                let vbits = valency_bits(valency);
                if vbits == 0 {
                    continue;
                }
                for row in lagged.iter().flatten() {
                    let x = st.window.dense_value(*row, var).map_or(0, |(x, _)| x);
                    let mut c = Variable::Computed {
                        parent: var,
                        bit_width: vbits,
                        value: x,
                    };
                    let mut child: Option<u64> = None;
                    loop {
                        let raw = c.encode()?;
                        let id = st.frames.promote(&self.system, FrameKind::Underlying, lag, raw)?;
                        wanted.insert(id, 2);
                        presence.insert(id);
                        if let Some(ch) = child {
                            parent.insert(ch, id);
                        }
                        child = Some(id);
                        match c.ancestor() {
                            Some(a) => c = a,
                            None => break,
                        }
                    }
                }
            }
            let mut observed: BTreeSet<u64> = BTreeSet::new();
            for row in lagged.iter().flatten() {
                observed.extend(st.window.sparse_values(*row));
            }
            for v in observed {
                let chain = st.window.ancestors(v).to_vec();
                let mut prev: Option<u64> = None;
                for raw in chain.iter().copied().chain(std::iter::once(v)) {
                    let id = st.frames.promote(&self.system, FrameKind::Underlying, lag, raw)?;
                    wanted.insert(id, 2);
                    presence.insert(id);
                    if let Some(p) = prev {
                        parent.insert(id, p);
                    }
                    prev = Some(id);
                }
            }
        }

        for lag in &history_lags {
            let lag = *lag;
            let mut observed: BTreeSet<u64> = BTreeSet::new();
            for j in &rows {
                if let Some(row) = st.frames.lagged_row(&st.window, *j, lag) {
                    let tag = st.slices.tag(row);
                    if tag != 0 {
                        observed.insert(tag);
                        observed.extend(st.decomp.ancestors(tag));
                    }
                }
            }
            for s in observed {
                let id = st.frames.promote(&self.system, FrameKind::History, lag, s)?;
                wanted.insert(id, 2);
                presence.insert(id);
                if let Some(p) = st.decomp.parent(s).filter(|p| *p != 0) {
                    let pid = st.frames.promote(&self.system, FrameKind::History, lag, p)?;
                    parent.insert(id, pid);
                }
            }
        }

        let view = st.view();
        let mut candidates = Selection::new(rows.len());
        for (var, valency) in &wanted {
            let column: Vec<u8> = rows.iter().map(|j| view.value(*j, *var)).collect();
            candidates.push(*var, *valency, column)?;
        }
        let mut ancestors: HashMap<u64, Vec<u64>> = HashMap::new();
        for v in &presence {
            let mut chain = Vec::new();
            let mut cur = *v;
            while let Some(p) = parent.get(&cur) {
                chain.push(*p);
                cur = *p;
            }
            ancestors.insert(*v, chain);
        }
        Ok(Snapshot { slice, rows, candidates, presence, ancestors, params })
    }

    /// Candidates by descending entropy, without zero-entropy columns or
    /// presence ancestors that match their descendant's count, capped at the
    /// feature limit.
    fn rank(&self, snap: &Snapshot) -> Vec<u64> {
        let z = snap.rows.len();
        let sel = &snap.candidates;
        let counts: HashMap<u64, usize> = snap
            .presence
            .iter()
            .filter_map(|v| sel.column_of(*v).map(|c| (*v, c.iter().filter(|x| **x != 0).count())))
            .collect();
        let mut redundant: HashSet<u64> = HashSet::new();
        for (v, n) in &counts {
            if *n == 0 {
                continue;
            }
            for a in snap.ancestors.get(v).map(|a| a.as_slice()).unwrap_or(&[]) {
                if counts.get(a) == Some(n) {
                    redundant.insert(*a);
                }
            }
        }
        let mut ranked: Vec<(f64, u64)> = sel
            .vars()
            .iter()
            .filter(|v| !redundant.contains(v))
            .map(|v| {
                let h = match counts.get(v) {
                    Some(n) => binary_entropy(*n, z),
                    None => self.kernel.entropy(sel, *v),
                };
                (h, *v)
            })
            .filter(|(h, _)| *h > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        ranked.truncate(snap.params.feature_limit(z));
        ranked.into_iter().map(|(_, v)| v).collect()
    }

    /// Rank the candidates, then layer. Runs unlocked.
    fn layer(&self, snap: &Snapshot) -> Result<Layering> {
        let chosen = self.rank(snap);
        if chosen.is_empty() {
            return Ok(Layering::Failed("no_candidates"));
        }
        let sub = snap.candidates.select(&chosen);
        let params = snap.params.layer_params(snap.slice);
        let shuffled = self.kernel.shuffle(&sub, params.seed);
        let layered = match self.kernel.layer(&sub, &shuffled, &params) {
            Some(l) => l,
            None => return Ok(Layering::Failed("no_rule")),
        };
        let best = match layered.best() {
            Some(g) if !g.derived.is_empty() => g.clone(),
            _ => return Ok(Layering::Failed("no_rule")),
        };
        for v in layered.fud.derived() {
            if sub.index_of(v).is_some() || is_computed(v) {
                return Err(ActiveError::Inconsistent(format!(
                    "kernel {} derived variable {} collides with a feature id",
                    self.kernel.name(),
                    v
                )));
            }
        }
        Ok(Layering::Found { outputs: best.derived, density: best.density, layered })
    }

    /// Rename the rule into this engine's variable space, grow the tree and
    /// move the slice's rows into the new children.
    fn integrate(
        &self,
        st: &mut ActiveState,
        snap: &Snapshot,
        layered: Layered,
        outputs: Vec<u64>,
    ) -> Result<InduceOutcome> {
        let slice = snap.slice;
        let population = snap.rows.len();
        if !st.decomp.is_leaf(slice) {
            return Err(ActiveError::Inconsistent(format!("slice {} grew while being induced", slice)));
        }
        let local = layered.fud.derived();
        let first = st.var_block.reserve(&self.system, local.len())?;
        let map = rename_map(&local, first);
        let outputs: Vec<u64> = outputs.iter().map(|v| map.get(v).copied().unwrap_or(*v)).collect();
        let fud = self.kernel.depends(&layered.fud.remap(&map), &outputs);

        let current: BTreeSet<usize> = st.slices.members(slice).cloned().unwrap_or_default();
        let snapped: BTreeSet<usize> = snap.rows.iter().copied().collect();
        let mut cells: BTreeMap<Vec<u8>, Vec<usize>> = BTreeMap::new();
        {
            let view = st.view();
            for j in current.intersection(&snapped) {
                let lookup = view.lookup(*j);
                let values = self.kernel.apply(&fud, &lookup, &outputs);
                cells.entry(values).or_default().push(*j);
            }
        }
        if cells.len() < 2 {
            let reason = if cells.is_empty() { "drained" } else { "no_split" };
            return Ok(self.failed(st, slice, population, reason));
        }

        let mut node_cells = Vec::with_capacity(cells.len());
        for values in cells.keys() {
            node_cells.push(Cell { values: values.clone(), child: st.slice_block.take(&self.system)? });
        }
        let remainder = st.slice_block.take(&self.system)?;
        let node = FudNode { parent: slice, fud, derived: outputs, cells: node_cells, remainder };
        let children = node.children();
        let assign: Vec<(u64, Vec<usize>)> = node
            .cells
            .iter()
            .zip(cells.into_values())
            .map(|(c, rows)| (c.child, rows))
            .collect();
        st.decomp.grow(node)?;

        for (child, rows) in assign {
            for j in rows {
                st.slices.reassign(&st.window, &st.decomp, j, child);
            }
        }
        let late: Vec<usize> = current.difference(&snapped).copied().collect();
        for j in &late {
            let path = self.classify_path(st, *j, slice);
            let leaf = match path.last() {
                Some(l) => *l,
                None => return Err(ActiveError::MissingRule(slice)),
            };
            st.slices.reassign(&st.window, &st.decomp, *j, leaf);
        }
        st.slices.refresh(&st.decomp, slice);
        if let Some(rest) = st.slices.members(slice) {
            return Err(ActiveError::Inconsistent(format!(
                "{} rows left in induced slice {}",
                rest.len(),
                slice
            )));
        }
        Ok(InduceOutcome::Grown { slice, population, children, late: late.len() })
    }
}
