//! Variable lookup against one window row.

use crate::decomp::Decomp;
use crate::frames::{FrameKind, Frames};
use crate::history::Window;
use crate::variable::{prefix, valency_bits, Variable};

/// Everything needed to read a feature value at a row: the window, the
/// frame tables and the current slice tags.
pub struct RowView<'a> {
    pub window: &'a Window,
    pub frames: &'a Frames,
    pub decomp: &'a Decomp,
    pub tags: &'a [u64],
}

impl<'a> RowView<'a> {
    pub fn new(window: &'a Window, frames: &'a Frames, decomp: &'a Decomp, tags: &'a [u64]) -> Self {
        Self { window, frames, decomp, tags }
    }

    /// Value of `var` at row `j`. Variables the row cannot see read 0.
    pub fn value(&self, j: usize, var: u64) -> u8 {
        if let Variable::Computed { parent, bit_width, value } = Variable::decode(var) {
            let (row, raw) = match self.locate(j, parent) {
                Some(x) => x,
                None => return 0,
            };
            return match self.window.dense_value(row, raw.1) {
                Some((x, valency)) => (prefix(x, valency_bits(valency), bit_width) == value) as u8,
                None => 0,
            };
        }
        match self.locate(j, var) {
            Some((row, (FrameKind::Underlying, raw))) => self.raw_value(row, raw),
            Some((row, (FrameKind::History, slice))) => self.slice_presence(row, slice),
            None => 0,
        }
    }

    /// Row and raw id that a possibly promoted id refers to.
    fn locate(&self, j: usize, var: u64) -> Option<(usize, (FrameKind, u64))> {
        match self.frames.resolve(var) {
            Some((kind, lag, raw)) => {
                let row = self.frames.lagged_row(self.window, j, lag)?;
                Some((row, (kind, raw)))
            }
            None => Some((j, (FrameKind::Underlying, var))),
        }
    }

    fn raw_value(&self, j: usize, var: u64) -> u8 {
        match self.window.dense_value(j, var) {
            Some((x, _)) => x,
            None => self.window.sparse_presence(j, var),
        }
    }

    /// 1 if row `j` is tagged `slice` or a descendant of it.
    fn slice_presence(&self, j: usize, slice: u64) -> u8 {
        let tag = self.tags.get(j).copied().unwrap_or(0);
        (tag == slice || self.decomp.is_ancestor(slice, tag)) as u8
    }

    /// Closure over row `j` for rule evaluation.
    pub fn lookup(&self, j: usize) -> impl Fn(u64) -> u8 + '_ {
        move |v| self.value(j, v)
    }
}
