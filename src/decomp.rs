//! The slice partition tree.
//!
//! Each node hangs a rule off a parent slice and names the child slice for
//! every output cell of the rule, plus a remainder child for outputs no cell
//! lists. `grow` is the only mutation and child ids never change once
//! issued.

use std::collections::HashMap;

use crate::error::{ActiveError, Result};
use crate::fud::Fud;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub values: Vec<u8>,
    pub child: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FudNode {
    pub parent: u64,
    pub fud: Fud,
    /// Output variables of `fud` whose joint values select a cell.
    pub derived: Vec<u64>,
    pub cells: Vec<Cell>,
    pub remainder: u64,
}

impl FudNode {
    /// Children in declaration order, remainder last.
    pub fn children(&self) -> Vec<u64> {
        self.cells
            .iter()
            .map(|c| c.child)
            .chain(std::iter::once(self.remainder))
            .collect()
    }

    /// The last cell matching `values` wins; no match means the remainder.
    pub fn select(&self, values: &[u8]) -> u64 {
        self.cells
            .iter()
            .rev()
            .find(|c| c.values == values)
            .map(|c| c.child)
            .unwrap_or(self.remainder)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Decomp {
    nodes: Vec<FudNode>,
    by_parent: HashMap<u64, usize>,
    parent_of: HashMap<u64, u64>,
    lengths: HashMap<u64, usize>,
}

impl Decomp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from nodes in growth order.
    pub fn from_nodes(nodes: Vec<FudNode>) -> Result<Self> {
        let mut d = Self::new();
        for node in nodes {
            d.grow(node)?;
        }
        Ok(d)
    }

    pub fn grow(&mut self, node: FudNode) -> Result<()> {
        if !self.is_slice(node.parent) {
            return Err(ActiveError::Inconsistent(format!("grow under unknown slice {}", node.parent)));
        }
        if self.by_parent.contains_key(&node.parent) {
            return Err(ActiveError::Inconsistent(format!("slice {} already has a rule", node.parent)));
        }
        let children = node.children();
        let mut fresh = std::collections::HashSet::new();
        for c in &children {
            if *c == 0 || self.parent_of.contains_key(c) || !fresh.insert(*c) {
                return Err(ActiveError::Inconsistent(format!("child slice id {} is not fresh", c)));
            }
        }
        let depth = self.length(node.parent) + 1;
        for c in children {
            self.parent_of.insert(c, node.parent);
            self.lengths.insert(c, depth);
        }
        self.by_parent.insert(node.parent, self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn nodes(&self) -> &[FudNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, parent: u64) -> Option<&FudNode> {
        self.by_parent.get(&parent).map(|i| &self.nodes[*i])
    }

    pub fn parent(&self, slice: u64) -> Option<u64> {
        self.parent_of.get(&slice).copied()
    }

    pub fn is_slice(&self, slice: u64) -> bool {
        slice == 0 || self.parent_of.contains_key(&slice)
    }

    pub fn is_leaf(&self, slice: u64) -> bool {
        self.is_slice(slice) && !self.by_parent.contains_key(&slice)
    }

    /// Depth from the root; the root is 0.
    pub fn length(&self, slice: u64) -> usize {
        self.lengths.get(&slice).copied().unwrap_or(0)
    }

    /// Slices from the root's child down to `slice`; empty for the root.
    pub fn path(&self, slice: u64) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.length(slice));
        let mut s = slice;
        while s != 0 {
            out.push(s);
            match self.parent(s) {
                Some(p) => s = p,
                None => break,
            }
        }
        out.reverse();
        out
    }

    /// Proper ancestors of `slice`, nearest first, excluding the root.
    pub fn ancestors(&self, slice: u64) -> Vec<u64> {
        let mut out = Vec::new();
        let mut s = slice;
        while let Some(p) = self.parent(s) {
            if p == 0 {
                break;
            }
            out.push(p);
            s = p;
        }
        out
    }

    pub fn is_ancestor(&self, ancestor: u64, slice: u64) -> bool {
        let mut s = slice;
        while let Some(p) = self.parent(s) {
            if p == ancestor {
                return true;
            }
            s = p;
        }
        false
    }

    /// Every slice id, root included.
    pub fn slices(&self) -> Vec<u64> {
        let mut out: Vec<u64> = std::iter::once(0).chain(self.parent_of.keys().copied()).collect();
        out.sort_unstable();
        out
    }

    pub fn leaves(&self) -> Vec<u64> {
        self.slices().into_iter().filter(|s| self.is_leaf(*s)).collect()
    }

    /// Descend from `start` applying each node's rule until a leaf.
    /// Returns the path walked, excluding `start`.
    pub fn classify_from(&self, start: u64, eval: &dyn Fn(&FudNode) -> Vec<u8>) -> Vec<u64> {
        let mut path = Vec::new();
        let mut s = start;
        while let Some(node) = self.node(s) {
            let values = eval(node);
            s = node.select(&values);
            path.push(s);
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fud::Transform;
    use std::collections::BTreeMap;

    fn split(parent: u64, var: u64, derived: u64, children: (u64, u64, u64)) -> FudNode {
        let table: BTreeMap<Vec<u8>, u8> = [(vec![0], 1), (vec![1], 2)].into_iter().collect();
        FudNode {
            parent,
            fud: Fud::new(vec![Transform::new(derived, 3, vec![var], table)]),
            derived: vec![derived],
            cells: vec![
                Cell { values: vec![1], child: children.0 },
                Cell { values: vec![2], child: children.1 },
            ],
            remainder: children.2,
        }
    }

    fn eval_with(values: HashMap<u64, u8>) -> impl Fn(&FudNode) -> Vec<u8> {
        move |node: &FudNode| node.fud.apply(&|v| values.get(&v).copied().unwrap_or(0), &node.derived)
    }

    #[test]
    fn test_grow_and_classify() {
        let mut d = Decomp::new();
        d.grow(split(0, 1, 100, (10, 11, 12))).unwrap();
        d.grow(split(11, 2, 101, (20, 21, 22))).unwrap();
        let eval = eval_with([(1, 1), (2, 0)].into_iter().collect());
        assert_eq!(d.classify_from(0, &eval), vec![11, 20]);
        assert_eq!(d.path(20), vec![11, 20]);
        assert_eq!(d.length(20), 2);
        assert!(d.is_ancestor(11, 21));
        assert!(!d.is_ancestor(10, 21));
        assert_eq!(d.leaves(), vec![10, 12, 20, 21, 22]);
    }

    #[test]
    fn test_classify_is_idempotent() {
        let mut d = Decomp::new();
        d.grow(split(0, 1, 100, (10, 11, 12))).unwrap();
        let eval = eval_with([(1, 0)].into_iter().collect());
        let first = d.classify_from(0, &eval);
        assert_eq!(first, d.classify_from(0, &eval));
        assert_eq!(first, vec![10]);
    }

    #[test]
    fn test_last_matching_cell_wins() {
        let mut node = split(0, 1, 100, (10, 11, 12));
        node.cells.push(Cell { values: vec![1], child: 13 });
        assert_eq!(node.select(&[1]), 13);
        assert_eq!(node.select(&[7]), 12);
    }

    #[test]
    fn test_grow_rejects_reused_ids() {
        let mut d = Decomp::new();
        d.grow(split(0, 1, 100, (10, 11, 12))).unwrap();
        assert!(d.grow(split(0, 1, 100, (30, 31, 32))).is_err());
        assert!(d.grow(split(10, 1, 100, (11, 40, 41))).is_err());
        assert!(d.grow(split(99, 1, 100, (50, 51, 52))).is_err());
        assert_eq!(d.len(), 1);
    }
}
