//! Frame offset tables.
//!
//! A frame looks back a fixed number of rows (or, in dynamic mode, slice
//! runs) from the row being examined. Variables seen through a frame get
//! promoted ids: each raw block is mapped to a fresh allocator block per
//! (kind, lag), keeping the offset, so a promoted id resolves back to its
//! raw id without a per-variable table.

use std::collections::HashMap;

use crate::config::FrameConfig;
use crate::error::Result;
use crate::history::Window;
use crate::system::ActiveSystem;
use crate::variable::{block_of, offset_of, Variable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FrameKind {
    /// Underlying dense and sparse variables.
    Underlying,
    /// Slice ids of earlier rows.
    History,
}

impl FrameKind {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Underlying => 0,
            FrameKind::History => 1,
        }
    }

    pub fn from_u8(x: u8) -> Option<Self> {
        match x {
            0 => Some(FrameKind::Underlying),
            1 => Some(FrameKind::History),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Promotion {
    pub kind: FrameKind,
    pub lag: usize,
    pub raw_block: u64,
    pub block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frames {
    pub config: FrameConfig,
    bits: u32,
    forward: HashMap<(FrameKind, usize, u64), u64>,
    reverse: HashMap<u64, (FrameKind, usize, u64)>,
    /// Dynamic mode: for each row, the last row of the slice run before
    /// the run the row belongs to.
    run_prev: Vec<Option<usize>>,
}

impl Frames {
    pub fn new(config: FrameConfig, size: usize, bits: u32) -> Self {
        Self {
            config,
            bits,
            forward: HashMap::new(),
            reverse: HashMap::new(),
            run_prev: vec![None; size],
        }
    }

    pub(crate) fn from_parts(
        config: FrameConfig,
        bits: u32,
        promotions: Vec<Promotion>,
        run_prev: Vec<Option<usize>>,
    ) -> Self {
        let mut frames = Self {
            config,
            bits,
            forward: HashMap::new(),
            reverse: HashMap::new(),
            run_prev,
        };
        for p in promotions {
            frames.forward.insert((p.kind, p.lag, p.raw_block), p.block);
            frames.reverse.insert(p.block, (p.kind, p.lag, p.raw_block));
        }
        frames
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn promotions(&self) -> Vec<Promotion> {
        let mut out: Vec<Promotion> = self
            .forward
            .iter()
            .map(|((kind, lag, raw_block), block)| Promotion {
                kind: *kind,
                lag: *lag,
                raw_block: *raw_block,
                block: *block,
            })
            .collect();
        out.sort_by_key(|p| p.block);
        out
    }

    pub fn run_prev(&self) -> &[Option<usize>] {
        &self.run_prev
    }

    /// Id of `raw` seen through frame (`kind`, `lag`). Underlying lag 0 is
    /// the raw id itself. Computed ids are promoted through their parent.
    pub fn promote(&mut self, system: &ActiveSystem, kind: FrameKind, lag: usize, raw: u64) -> Result<u64> {
        if kind == FrameKind::Underlying && lag == 0 {
            return Ok(raw);
        }
        if let Variable::Computed { parent, bit_width, value } = Variable::decode(raw) {
            let parent = self.promote(system, kind, lag, parent)?;
            return Variable::Computed { parent, bit_width, value }.encode();
        }
        let raw_block = block_of(raw, self.bits);
        let block = match self.forward.get(&(kind, lag, raw_block)) {
            Some(b) => *b,
            None => {
                let b = block_of(system.next(self.bits)?, self.bits);
                self.forward.insert((kind, lag, raw_block), b);
                self.reverse.insert(b, (kind, lag, raw_block));
                b
            }
        };
        Ok((block << self.bits) | offset_of(raw, self.bits))
    }

    /// Frame and raw id behind a promoted id. Computed ids are not resolved
    /// here; resolve their parent instead.
    pub fn resolve(&self, var: u64) -> Option<(FrameKind, usize, u64)> {
        if crate::variable::is_computed(var) {
            return None;
        }
        self.reverse
            .get(&block_of(var, self.bits))
            .map(|(kind, lag, raw_block)| (*kind, *lag, (raw_block << self.bits) | offset_of(var, self.bits)))
    }

    /// Row `lag` steps before `j`. Steps are rows, or slice runs when
    /// dynamic.
    pub fn lagged_row(&self, window: &Window, j: usize, lag: usize) -> Option<usize> {
        if lag == 0 {
            return window.is_populated(j).then_some(j);
        }
        if !self.config.dynamic {
            return window.lagged(j, lag);
        }
        let mut cur = j;
        for _ in 0..lag {
            let next = (*self.run_prev.get(cur)?)?;
            if !window.is_populated(next) || window.age(next) >= window.age(cur) {
                return None;
            }
            cur = next;
        }
        Some(cur)
    }

    /// Record the run link of the newly admitted row `j`.
    pub fn admit(&mut self, window: &Window, tags: &[u64], j: usize) {
        if j >= self.run_prev.len() {
            return;
        }
        self.run_prev[j] = match window.lagged(j, 1) {
            Some(p) if tags[p] != tags[j] => Some(p),
            Some(p) => self.run_prev[p],
            None => None,
        };
    }

    pub fn reset_rows(&mut self, size: usize) {
        self.run_prev = vec![None; size];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::DenseSpec;
    use crate::store::{DenseRow, SparseRow};

    fn config(dynamic: bool) -> FrameConfig {
        FrameConfig { underlying: vec![1], history: vec![1], dynamic }
    }

    #[test]
    fn test_promote_and_resolve() {
        let sys = ActiveSystem::new(16);
        let mut frames = Frames::new(config(false), 4, 16);
        let raw = (5 << 16) | 7;
        assert_eq!(frames.promote(&sys, FrameKind::Underlying, 0, raw).unwrap(), raw);
        let p = frames.promote(&sys, FrameKind::Underlying, 1, raw).unwrap();
        assert_ne!(p, raw);
        assert_eq!(offset_of(p, 16), 7);
        assert_eq!(frames.resolve(p), Some((FrameKind::Underlying, 1, raw)));
        // same raw block reuses the promoted block
        let q = frames.promote(&sys, FrameKind::Underlying, 1, (5 << 16) | 9).unwrap();
        assert_eq!(block_of(q, 16), block_of(p, 16));
        let h = frames.promote(&sys, FrameKind::History, 1, raw).unwrap();
        assert_ne!(block_of(h, 16), block_of(p, 16));
        assert_eq!(frames.resolve(raw), None);
    }

    #[test]
    fn test_computed_promoted_through_parent() {
        let sys = ActiveSystem::new(16);
        let mut frames = Frames::new(config(false), 4, 16);
        let c = Variable::Computed { parent: 3, bit_width: 1, value: 1 }.encode().unwrap();
        let p = frames.promote(&sys, FrameKind::Underlying, 1, c).unwrap();
        match Variable::decode(p) {
            Variable::Computed { parent, bit_width, value } => {
                assert_eq!(frames.resolve(parent), Some((FrameKind::Underlying, 1, 3)));
                assert_eq!((bit_width, value), (1, 1));
            }
            other => panic!("expected computed, got {:?}", other),
        }
    }

    #[test]
    fn test_dynamic_lag_counts_runs() {
        let mut w = Window::new(6, &[DenseSpec::new(vec![1], vec![2])], 0).unwrap();
        let mut frames = Frames::new(config(true), 6, 16);
        let tags = [5u64, 5, 6, 6, 6, 7];
        let row = DenseRow::new(vec![1], vec![2], vec![0]);
        let empty: [&SparseRow; 0] = [];
        for _ in 0..6 {
            let j = w.admit(&[&row], &empty).unwrap();
            frames.admit(&w, &tags, j);
        }
        assert_eq!(frames.lagged_row(&w, 4, 1), Some(1));
        assert_eq!(frames.lagged_row(&w, 5, 1), Some(4));
        assert_eq!(frames.lagged_row(&w, 5, 2), Some(1));
        assert_eq!(frames.lagged_row(&w, 5, 3), None);
        assert_eq!(frames.lagged_row(&w, 1, 1), None);
    }
}
