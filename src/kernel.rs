//! The Model Kernel seam.
//!
//! The engine never computes entropies or searches for rules itself; it hands
//! a [`Selection`] to a [`ModelKernel`] and receives a layered rule back.
//! Default methods cover the generic primitives so an implementation only
//! has to supply `layer`.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};

use crate::error::{ActiveError, Result};
use crate::fud::{Fud, Transform};

/// A variable-major copy of some rows: `values[i * size + k]` is variable
/// `i` at row `k`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    vars: Vec<u64>,
    valencies: Vec<u16>,
    size: usize,
    values: Vec<u8>,
}

impl Selection {
    pub fn new(size: usize) -> Self {
        Self { vars: Vec::new(), valencies: Vec::new(), size, values: Vec::new() }
    }

    pub fn push(&mut self, var: u64, valency: u16, column: Vec<u8>) -> Result<()> {
        if column.len() != self.size {
            return Err(ActiveError::Inconsistent(format!(
                "column for {} has {} rows, selection has {}",
                var,
                column.len(),
                self.size
            )));
        }
        self.vars.push(var);
        self.valencies.push(valency);
        self.values.extend(column);
        Ok(())
    }

    pub fn vars(&self) -> &[u64] {
        &self.vars
    }

    pub fn valencies(&self) -> &[u16] {
        &self.valencies
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dimension(&self) -> usize {
        self.vars.len()
    }

    pub fn index_of(&self, var: u64) -> Option<usize> {
        self.vars.iter().position(|v| *v == var)
    }

    pub fn column(&self, i: usize) -> &[u8] {
        &self.values[i * self.size..(i + 1) * self.size]
    }

    pub fn column_of(&self, var: u64) -> Option<&[u8]> {
        self.index_of(var).map(|i| self.column(i))
    }

    /// Sub-selection in the order given. Unknown variables are skipped.
    pub fn select(&self, vars: &[u64]) -> Selection {
        let mut out = Selection::new(self.size);
        for v in vars {
            if let Some(i) = self.index_of(*v) {
                out.vars.push(*v);
                out.valencies.push(self.valencies[i]);
                out.values.extend_from_slice(self.column(i));
            }
        }
        out
    }

    fn column_mut(&mut self, i: usize) -> &mut [u8] {
        let size = self.size;
        &mut self.values[i * size..(i + 1) * size]
    }
}

/// Counts of value tuples over a set of variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histogram {
    pub counts: BTreeMap<Vec<u8>, usize>,
    pub total: usize,
}

impl Histogram {
    /// Shannon entropy in nats.
    pub fn entropy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let z = self.total as f64;
        self.counts
            .values()
            .filter(|c| **c > 0)
            .map(|c| {
                let p = *c as f64 / z;
                -p * p.ln()
            })
            .sum()
    }
}

/// Entropy of a 0/1 indicator present on `count` of `total` rows.
pub fn binary_entropy(count: usize, total: usize) -> f64 {
    if total == 0 || count == 0 || count >= total {
        return 0.0;
    }
    let p = count as f64 / total as f64;
    let q = 1.0 - p;
    -p * p.ln() - q * q.ln()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerParams {
    /// Largest valency a derived variable may have.
    pub wmax: u16,
    pub seed: u64,
}

impl Default for LayerParams {
    fn default() -> Self {
        Self { wmax: 9, seed: 5 }
    }
}

/// One candidate partition: the derived variables whose joint values define
/// the cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Grouping {
    pub derived: Vec<u64>,
    pub alignment: f64,
    pub density: f64,
}

/// Result of layering. Groupings are in ascending alignment order.
/// Derived ids are local to the kernel and must not collide with the ids of
/// the selection it was given; the caller renames them.
#[derive(Debug, Clone, PartialEq)]
pub struct Layered {
    pub fud: Fud,
    pub groupings: Vec<Grouping>,
}

impl Layered {
    pub fn best(&self) -> Option<&Grouping> {
        self.groupings.last()
    }
}

pub trait ModelKernel: Send + Sync {
    fn name(&self) -> &str;

    /// Search for a rule over `selection`, using `shuffled` as the
    /// independent baseline. `None` when nothing worth keeping was found.
    fn layer(&self, selection: &Selection, shuffled: &Selection, params: &LayerParams) -> Option<Layered>;

    fn reduce(&self, selection: &Selection, vars: &[u64]) -> Histogram {
        let cols: Vec<&[u8]> = vars.iter().filter_map(|v| selection.column_of(*v)).collect();
        let mut hist = Histogram { counts: BTreeMap::new(), total: selection.size() };
        for k in 0..selection.size() {
            let key: Vec<u8> = cols.iter().map(|c| c[k]).collect();
            *hist.counts.entry(key).or_insert(0) += 1;
        }
        hist
    }

    fn entropy(&self, selection: &Selection, var: u64) -> f64 {
        self.reduce(selection, &[var]).entropy()
    }

    /// Permute each variable's column independently. Marginals are kept,
    /// alignments between variables are destroyed.
    fn shuffle(&self, selection: &Selection, seed: u64) -> Selection {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut out = selection.clone();
        for i in 0..out.dimension() {
            out.column_mut(i).shuffle(&mut rng);
        }
        out
    }

    fn apply(&self, fud: &Fud, lookup: &dyn Fn(u64) -> u8, outputs: &[u64]) -> Vec<u8> {
        fud.apply(lookup, outputs)
    }

    fn depends(&self, fud: &Fud, outputs: &[u64]) -> Fud {
        fud.depends(outputs)
    }
}

/// Reference kernel: scores variable pairs by the excess of their mutual
/// information over the shuffled baseline and derives a variable from the
/// most frequent joint states of each of the best pairs.
#[derive(Debug, Clone)]
pub struct MutualInfoKernel {
    /// Number of candidate pairs turned into groupings.
    pub pairs: usize,
}

impl Default for MutualInfoKernel {
    fn default() -> Self {
        Self { pairs: 3 }
    }
}

impl MutualInfoKernel {
    fn alignment(&self, sel: &Selection, shuffled: &Selection, vars: &[u64]) -> f64 {
        let z = sel.size() as f64;
        let joint = |s: &Selection| {
            let marginal: f64 = vars.iter().map(|v| self.entropy(s, *v)).sum();
            marginal - self.reduce(s, vars).entropy()
        };
        z * (joint(sel) - joint(shuffled))
    }

    fn transform(&self, sel: &Selection, vars: &[u64], derived: u64, wmax: u16) -> Transform {
        let hist = self.reduce(sel, vars);
        let mut states: Vec<(Vec<u8>, usize)> = hist.counts.into_iter().collect();
        // most frequent first, ties by state
        states.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        // derived values 1..=top, rarer states share the top value
        let top = (wmax.max(2) as usize - 1).min(u8::MAX as usize);
        let mut table = BTreeMap::new();
        for (i, (state, _)) in states.iter().enumerate() {
            table.insert(state.clone(), (i.min(top - 1) + 1) as u8);
        }
        let valency = (states.len().min(top) + 1) as u16;
        Transform::new(derived, valency, vars.to_vec(), table)
    }
}

impl ModelKernel for MutualInfoKernel {
    fn name(&self) -> &str {
        "mutual_info"
    }

    fn layer(&self, selection: &Selection, shuffled: &Selection, params: &LayerParams) -> Option<Layered> {
        let vars = selection.vars();
        if vars.is_empty() || selection.size() == 0 {
            return None;
        }
        let mut scored: Vec<(f64, Vec<u64>)> = Vec::new();
        if vars.len() == 1 {
            scored.push((0.0, vec![vars[0]]));
        }
        for a in 0..vars.len() {
            for b in a + 1..vars.len() {
                let pair = vec![vars[a], vars[b]];
                scored.push((self.alignment(selection, shuffled, &pair), pair));
            }
        }
        scored.sort_by(|x, y| y.0.total_cmp(&x.0).then_with(|| x.1.cmp(&y.1)));
        scored.truncate(self.pairs.max(1));

        let base = vars
            .iter()
            .copied()
            .filter(|v| !crate::variable::is_computed(*v))
            .max()
            .unwrap_or(0)
            + 1;
        let z = selection.size() as f64;
        let mut transforms = Vec::new();
        let mut groupings = Vec::new();
        // ascending alignment: walk the best-first list backwards
        for (i, (alignment, pair)) in scored.iter().rev().enumerate() {
            let derived = base + i as u64;
            transforms.push(self.transform(selection, pair, derived, params.wmax));
            groupings.push(Grouping {
                derived: vec![derived],
                alignment: *alignment,
                density: alignment / z,
            });
        }
        Some(Layered { fud: Fud::new(transforms), groupings })
    }
}

/// Test double: splits on the value of one fixed variable.
#[derive(Debug, Clone)]
pub struct StubKernel {
    pub var: u64,
    pub density: f64,
}

impl StubKernel {
    pub fn new(var: u64) -> Self {
        Self { var, density: 1.0 }
    }
}

impl ModelKernel for StubKernel {
    fn name(&self) -> &str {
        "stub"
    }

    fn layer(&self, selection: &Selection, _shuffled: &Selection, _params: &LayerParams) -> Option<Layered> {
        let column = selection.column_of(self.var)?;
        let mut seen: Vec<u8> = column.to_vec();
        seen.sort_unstable();
        seen.dedup();
        let derived = selection.vars().iter().copied().filter(|v| !crate::variable::is_computed(*v)).max()? + 1;
        let table = seen.iter().map(|x| (vec![*x], *x)).collect();
        let valency = seen.last().map(|m| *m as u16 + 1).unwrap_or(1);
        Some(Layered {
            fud: Fud::new(vec![Transform::new(derived, valency, vec![self.var], table)]),
            groupings: vec![Grouping { derived: vec![derived], alignment: 1.0, density: self.density }],
        })
    }
}

/// Map kernel-local derived ids onto consecutive ids from `first`.
pub fn rename_map(local: &[u64], first: u64) -> HashMap<u64, u64> {
    local.iter().enumerate().map(|(i, v)| (*v, first + i as u64)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection() -> Selection {
        let mut sel = Selection::new(8);
        sel.push(1, 2, vec![0, 1, 0, 1, 0, 1, 0, 1]).unwrap();
        sel.push(2, 2, vec![0, 1, 0, 1, 0, 1, 0, 1]).unwrap();
        sel.push(3, 2, vec![0, 0, 1, 1, 0, 0, 1, 1]).unwrap();
        sel
    }

    #[test]
    fn test_entropy_of_fair_binary() {
        let k = MutualInfoKernel::default();
        let h = k.entropy(&selection(), 1);
        assert!((h - std::f64::consts::LN_2).abs() < 1e-12);
        assert!((binary_entropy(4, 8) - std::f64::consts::LN_2).abs() < 1e-12);
        assert_eq!(binary_entropy(0, 8), 0.0);
        assert_eq!(binary_entropy(8, 8), 0.0);
    }

    #[test]
    fn test_shuffle_is_deterministic_and_keeps_marginals() {
        let k = MutualInfoKernel::default();
        let sel = selection();
        let a = k.shuffle(&sel, 7);
        let b = k.shuffle(&sel, 7);
        assert_eq!(a, b);
        let mut col: Vec<u8> = a.column(0).to_vec();
        col.sort_unstable();
        assert_eq!(col, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_select_reorders_and_skips() {
        let sel = selection();
        let sub = sel.select(&[3, 9, 1]);
        assert_eq!(sub.vars(), &[3, 1]);
        assert_eq!(sub.column(0), sel.column(2));
    }

    #[test]
    fn test_push_rejects_short_column() {
        let mut sel = Selection::new(3);
        assert!(sel.push(1, 2, vec![0, 1]).is_err());
    }

    #[test]
    fn test_mutual_info_prefers_aligned_pair() {
        let k = MutualInfoKernel::default();
        let a: Vec<u8> = (0..16).map(|i| (i % 2) as u8).collect();
        let c: Vec<u8> = (0..16).map(|i| ((i / 2) % 2) as u8).collect();
        let mut sel = Selection::new(16);
        sel.push(1, 2, a.clone()).unwrap();
        sel.push(2, 2, a).unwrap();
        sel.push(3, 2, c).unwrap();
        let shuffled = k.shuffle(&sel, 11);
        let layered = k.layer(&sel, &shuffled, &LayerParams::default()).unwrap();
        let best = layered.best().unwrap();
        let t = layered.fud.transforms.iter().find(|t| t.derived == best.derived[0]).unwrap();
        assert_eq!(t.inputs, vec![1, 2]);
        assert!(best.derived[0] > 3);
        for w in layered.groupings.windows(2) {
            assert!(w[0].alignment <= w[1].alignment);
        }
    }

    #[test]
    fn test_stub_splits_on_var() {
        let k = StubKernel::new(3);
        let sel = selection();
        let layered = k.layer(&sel, &sel, &LayerParams::default()).unwrap();
        let out = layered.best().unwrap().derived.clone();
        let lookup = |v: u64| if v == 3 { 1 } else { 0 };
        assert_eq!(k.apply(&layered.fud, &lookup, &out), vec![1]);
    }
}
