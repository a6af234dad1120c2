//! Slice membership over the window.
//!
//! Every populated row carries the tag of the leaf slice it classifies to.
//! Member sets, eligibility, failure marks and the optional caches are all
//! updated through `admit` and `reassign` so they never drift from the tags.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::decomp::Decomp;
use crate::error::{ActiveError, Result};
use crate::history::Window;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceTable {
    tags: Vec<u64>,
    members: HashMap<u64, BTreeSet<usize>>,
    eligible: BTreeSet<u64>,
    /// Population at the last failed induction of each slice.
    failures: HashMap<u64, usize>,
    thresholds: Vec<usize>,
    /// Population of each slice including its descendants.
    cumulative: Option<HashMap<u64, usize>>,
    /// Counts of consecutive row pairs by (earlier tag, later tag).
    transitions: Option<HashMap<(u64, u64), usize>>,
}

impl SliceTable {
    pub fn new(size: usize, thresholds: &[usize], cumulative: bool, transitions: bool) -> Self {
        Self {
            tags: vec![0; size],
            members: HashMap::new(),
            eligible: BTreeSet::new(),
            failures: HashMap::new(),
            thresholds: thresholds.to_vec(),
            cumulative: cumulative.then(HashMap::new),
            transitions: transitions.then(HashMap::new),
        }
    }

    pub fn tags(&self) -> &[u64] {
        &self.tags
    }

    pub fn tag(&self, j: usize) -> u64 {
        self.tags[j]
    }

    pub fn members(&self, slice: u64) -> Option<&BTreeSet<usize>> {
        self.members.get(&slice)
    }

    pub fn size(&self, slice: u64) -> usize {
        self.members.get(&slice).map_or(0, |m| m.len())
    }

    /// Occupied slices and their populations.
    pub fn populations(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.members.iter().filter(|(_, m)| !m.is_empty()).map(|(s, m)| (*s, m.len()))
    }

    pub fn eligible(&self) -> &BTreeSet<u64> {
        &self.eligible
    }

    pub fn is_eligible(&self, slice: u64) -> bool {
        self.eligible.contains(&slice)
    }

    pub fn failures(&self) -> &HashMap<u64, usize> {
        &self.failures
    }

    pub fn thresholds(&self) -> &[usize] {
        &self.thresholds
    }

    pub fn cumulative(&self) -> Option<&HashMap<u64, usize>> {
        self.cumulative.as_ref()
    }

    pub fn transitions(&self) -> Option<&HashMap<(u64, u64), usize>> {
        self.transitions.as_ref()
    }

    pub fn cumulative_size(&self, slice: u64) -> Option<usize> {
        self.cumulative.as_ref().map(|c| c.get(&slice).copied().unwrap_or(0))
    }

    pub fn transition_count(&self, from: u64, to: u64) -> Option<usize> {
        self.transitions.as_ref().map(|t| t.get(&(from, to)).copied().unwrap_or(0))
    }

    /// Whether a leaf with `population` rows may be induced.
    pub fn allows(&self, slice: u64, population: usize) -> bool {
        let first = match self.thresholds.first() {
            Some(t) => *t,
            None => return false,
        };
        if population < first {
            return false;
        }
        match self.failures.get(&slice) {
            None => true,
            Some(failed) => match self.thresholds.iter().find(|t| **t > *failed) {
                Some(next) => population >= *next,
                None => false,
            },
        }
    }

    /// Re-evaluate eligibility; true when it changed.
    pub fn refresh(&mut self, decomp: &Decomp, slice: u64) -> bool {
        let want = decomp.is_leaf(slice) && self.allows(slice, self.size(slice));
        if want {
            self.eligible.insert(slice)
        } else {
            self.eligible.remove(&slice)
        }
    }

    /// Largest eligible slice not in `busy`. Ties go to the lower id.
    pub fn largest_eligible(&self, busy: &BTreeSet<u64>) -> Option<(u64, usize)> {
        self.eligible
            .iter()
            .filter(|s| !busy.contains(s))
            .map(|s| (*s, self.size(*s)))
            .fold(None, |best: Option<(u64, usize)>, (s, n)| match best {
                Some((_, m)) if m >= n => best,
                _ => Some((s, n)),
            })
    }

    pub fn record_failure(&mut self, decomp: &Decomp, slice: u64, population: usize) {
        self.failures.insert(slice, population);
        self.refresh(decomp, slice);
    }

    /// Tag the freshly admitted row `j`. `replaced` is whether `j` held a
    /// row before this admission.
    pub fn admit(&mut self, window: &Window, decomp: &Decomp, j: usize, slice: u64, replaced: bool) {
        let size = window.size();
        if replaced {
            let old = self.tags[j];
            self.detach(decomp, j, old);
            // j was the oldest row; its successor is now the oldest
            if size > 1 {
                let next = self.tags[(j + 1) % size];
                self.bump_transition(old, next, false);
            }
            self.refresh(decomp, old);
        }
        self.attach(decomp, j, slice);
        if let Some(p) = window.lagged(j, 1) {
            let prev = self.tags[p];
            self.bump_transition(prev, slice, true);
        }
        self.refresh(decomp, slice);
    }

    /// Move a populated row to another slice.
    pub fn reassign(&mut self, window: &Window, decomp: &Decomp, j: usize, slice: u64) {
        let old = self.tags[j];
        if old == slice {
            return;
        }
        if let Some(p) = window.lagged(j, 1) {
            let prev = self.tags[p];
            self.bump_transition(prev, old, false);
            self.bump_transition(prev, slice, true);
        }
        let q = (j + 1) % window.size();
        if q != j && window.lagged(q, 1) == Some(j) {
            let next = self.tags[q];
            self.bump_transition(old, next, false);
            self.bump_transition(slice, next, true);
        }
        self.detach(decomp, j, old);
        self.attach(decomp, j, slice);
        self.refresh(decomp, old);
        self.refresh(decomp, slice);
    }

    fn attach(&mut self, decomp: &Decomp, j: usize, slice: u64) {
        self.tags[j] = slice;
        self.members.entry(slice).or_default().insert(j);
        self.bump_cumulative(decomp, slice, true);
    }

    fn detach(&mut self, decomp: &Decomp, j: usize, slice: u64) {
        if let Some(m) = self.members.get_mut(&slice) {
            m.remove(&j);
            if m.is_empty() {
                self.members.remove(&slice);
            }
        }
        self.bump_cumulative(decomp, slice, false);
    }

    fn bump_cumulative(&mut self, decomp: &Decomp, slice: u64, up: bool) {
        let cumulative = match self.cumulative.as_mut() {
            Some(c) => c,
            None => return,
        };
        let chain = std::iter::once(slice)
            .chain(decomp.ancestors(slice))
            .chain((slice != 0).then_some(0));
        for s in chain {
            let n = cumulative.entry(s).or_insert(0);
            *n = if up { *n + 1 } else { n.saturating_sub(1) };
            if *n == 0 {
                cumulative.remove(&s);
            }
        }
    }

    fn bump_transition(&mut self, from: u64, to: u64, up: bool) {
        let transitions = match self.transitions.as_mut() {
            Some(t) => t,
            None => return,
        };
        let n = transitions.entry((from, to)).or_insert(0);
        *n = if up { *n + 1 } else { n.saturating_sub(1) };
        if *n == 0 {
            transitions.remove(&(from, to));
        }
    }

    /// Rebuild every derived structure from the tags of the populated rows.
    pub fn rebuild(&mut self, window: &Window, decomp: &Decomp, tags: Vec<u64>) -> Result<()> {
        if tags.len() != window.size() {
            return Err(ActiveError::Format(format!(
                "{} slice tags for a window of {}",
                tags.len(),
                window.size()
            )));
        }
        for j in window.rows_in_order() {
            if !decomp.is_leaf(tags[j]) {
                return Err(ActiveError::Format(format!("row {} tagged with non-leaf slice {}", j, tags[j])));
            }
        }
        self.tags = tags;
        self.members.clear();
        self.eligible.clear();
        if let Some(c) = self.cumulative.as_mut() {
            c.clear();
        }
        if let Some(t) = self.transitions.as_mut() {
            t.clear();
        }
        let order = window.rows_in_order();
        for (k, j) in order.iter().enumerate() {
            let slice = self.tags[*j];
            self.members.entry(slice).or_default().insert(*j);
            self.bump_cumulative(decomp, slice, true);
            if k > 0 {
                let prev = self.tags[order[k - 1]];
                self.bump_transition(prev, slice, true);
            }
        }
        let occupied: HashSet<u64> = self.members.keys().copied().collect();
        for s in occupied {
            self.refresh(decomp, s);
        }
        Ok(())
    }

    /// Replace the threshold list and re-evaluate every occupied slice.
    pub fn set_thresholds(&mut self, decomp: &Decomp, thresholds: &[usize]) {
        self.thresholds = thresholds.to_vec();
        self.eligible.clear();
        let occupied: Vec<u64> = self.members.keys().copied().collect();
        for s in occupied {
            self.refresh(decomp, s);
        }
    }

    pub(crate) fn set_failures(&mut self, failures: HashMap<u64, usize>) {
        self.failures = failures;
    }

    pub(crate) fn set_caches(
        &mut self,
        cumulative: Option<HashMap<u64, usize>>,
        transitions: Option<HashMap<(u64, u64), usize>>,
    ) {
        if self.cumulative.is_some() {
            if let Some(c) = cumulative {
                self.cumulative = Some(c);
            }
        }
        if self.transitions.is_some() {
            if let Some(t) = transitions {
                self.transitions = Some(t);
            }
        }
    }

    /// Tags, member sets and populated rows describe the same partition.
    pub fn check(&self, window: &Window) -> Result<()> {
        let populated: BTreeSet<usize> = window.rows_in_order().into_iter().collect();
        let mut seen = BTreeSet::new();
        for (slice, rows) in &self.members {
            for j in rows {
                if !seen.insert(*j) {
                    return Err(ActiveError::Inconsistent(format!("row {} in more than one slice", j)));
                }
                if self.tags[*j] != *slice {
                    return Err(ActiveError::Inconsistent(format!(
                        "row {} tagged {} but member of {}",
                        j, self.tags[*j], slice
                    )));
                }
            }
        }
        if seen != populated {
            return Err(ActiveError::Inconsistent(format!(
                "{} rows in slices, {} populated",
                seen.len(),
                populated.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomp::{Cell, FudNode};
    use crate::fud::Fud;
    use crate::history::DenseSpec;
    use crate::store::{DenseRow, SparseRow};

    fn window(size: usize) -> Window {
        Window::new(size, &[DenseSpec::new(vec![1], vec![2])], 0).unwrap()
    }

    fn push(w: &mut Window, t: &mut SliceTable, d: &Decomp, slice: u64) -> usize {
        let replaced = w.replaces();
        let empty: [&SparseRow; 0] = [];
        let j = w.admit(&[&DenseRow::new(vec![1], vec![2], vec![0])], &empty).unwrap();
        t.admit(w, d, j, slice, replaced);
        j
    }

    #[test]
    fn test_eligible_exactly_at_threshold() {
        let d = Decomp::new();
        let mut w = window(8);
        let mut t = SliceTable::new(8, &[3], false, false);
        push(&mut w, &mut t, &d, 0);
        push(&mut w, &mut t, &d, 0);
        assert!(!t.is_eligible(0));
        assert!(!t.refresh(&d, 0));
        push(&mut w, &mut t, &d, 0);
        assert!(t.is_eligible(0));
        // no second transition while still above
        assert!(!t.refresh(&d, 0));
    }

    #[test]
    fn test_eligibility_lost_below_threshold() {
        let d = Decomp::new();
        let mut w = window(3);
        let mut t = SliceTable::new(3, &[3], false, false);
        for _ in 0..3 {
            push(&mut w, &mut t, &d, 0);
        }
        assert!(t.is_eligible(0));
        // overwrite the oldest row with a row of another slice
        let j = push(&mut w, &mut t, &d, 7);
        assert_eq!(j, 0);
        assert!(!t.is_eligible(0));
        assert_eq!(t.size(0), 2);
        t.check(&w).unwrap();
    }

    #[test]
    fn test_failure_defers_to_next_threshold() {
        let d = Decomp::new();
        let mut w = window(16);
        let mut t = SliceTable::new(16, &[2, 4, 8], false, false);
        push(&mut w, &mut t, &d, 0);
        push(&mut w, &mut t, &d, 0);
        assert!(t.is_eligible(0));
        t.record_failure(&d, 0, 2);
        assert!(!t.is_eligible(0));
        push(&mut w, &mut t, &d, 0);
        assert!(!t.is_eligible(0));
        push(&mut w, &mut t, &d, 0);
        assert!(t.is_eligible(0));
        t.record_failure(&d, 0, 9);
        for _ in 0..8 {
            push(&mut w, &mut t, &d, 0);
        }
        assert!(!t.is_eligible(0));
    }

    #[test]
    fn test_caches_follow_reassignment() {
        let mut d = Decomp::new();
        let mut w = window(4);
        let mut t = SliceTable::new(4, &[10], true, true);
        for _ in 0..3 {
            push(&mut w, &mut t, &d, 0);
        }
        assert_eq!(t.transition_count(0, 0), Some(2));
        d.grow(FudNode {
            parent: 0,
            fud: Fud::default(),
            derived: vec![],
            cells: vec![Cell { values: vec![], child: 5 }],
            remainder: 6,
        })
        .unwrap();
        t.reassign(&w, &d, 0, 5);
        t.reassign(&w, &d, 1, 6);
        t.reassign(&w, &d, 2, 5);
        assert_eq!(t.transition_count(5, 6), Some(1));
        assert_eq!(t.transition_count(6, 5), Some(1));
        assert_eq!(t.transition_count(0, 0), Some(0));
        assert_eq!(t.cumulative_size(0), Some(3));
        assert_eq!(t.cumulative_size(5), Some(2));
        t.check(&w).unwrap();

        let mut rebuilt = SliceTable::new(4, &[10], true, true);
        rebuilt.rebuild(&w, &d, t.tags().to_vec()).unwrap();
        assert_eq!(rebuilt, t);
    }

    #[test]
    fn test_transition_dropped_with_oldest_row() {
        let d = Decomp::new();
        let mut w = window(2);
        let mut t = SliceTable::new(2, &[10], false, true);
        push(&mut w, &mut t, &d, 1);
        push(&mut w, &mut t, &d, 2);
        assert_eq!(t.transition_count(1, 2), Some(1));
        push(&mut w, &mut t, &d, 3);
        assert_eq!(t.transition_count(1, 2), Some(0));
        assert_eq!(t.transition_count(2, 3), Some(1));
    }
}
