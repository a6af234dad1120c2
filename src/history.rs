//! The history window: a fixed-capacity circular buffer of merged rows.
//!
//! Dense sources are stored event-major (`size x dimension` bytes) with
//! their variable list and valencies as the shape descriptor. Sparse sources
//! hold one value per row.

use std::collections::HashMap;

use crate::error::{ActiveError, Result};
use crate::store::{DenseRow, SparseRow};

/// Largest window an engine will allocate.
pub const WINDOW_MAX: usize = 1 << 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryDense {
    vars: Vec<u64>,
    shape: Vec<u16>,
    size: usize,
    values: Vec<u8>,
    index: HashMap<u64, usize>,
}

impl HistoryDense {
    pub fn new(vars: Vec<u64>, shape: Vec<u16>, size: usize) -> Result<Self> {
        Self::with_values(vars, shape, size, Vec::new())
    }

    pub fn with_values(vars: Vec<u64>, shape: Vec<u16>, size: usize, mut values: Vec<u8>) -> Result<Self> {
        if vars.is_empty() || vars.len() != shape.len() {
            return Err(ActiveError::Inconsistent(format!(
                "dense history needs matching vars and shape, got {} and {}",
                vars.len(),
                shape.len()
            )));
        }
        let cells = size * vars.len();
        if values.is_empty() {
            values = vec![0; cells];
        } else if values.len() != cells {
            return Err(ActiveError::Inconsistent(format!(
                "dense history expects {} cells, got {}",
                cells,
                values.len()
            )));
        }
        let index = vars.iter().enumerate().map(|(i, v)| (*v, i)).collect();
        Ok(Self { vars, shape, size, values, index })
    }

    pub fn vars(&self) -> &[u64] {
        &self.vars
    }

    pub fn shape(&self) -> &[u16] {
        &self.shape
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dimension(&self) -> usize {
        self.vars.len()
    }

    pub fn values(&self) -> &[u8] {
        &self.values
    }

    pub fn row(&self, j: usize) -> &[u8] {
        let n = self.vars.len();
        &self.values[j * n..(j + 1) * n]
    }

    pub fn position(&self, var: u64) -> Option<usize> {
        self.index.get(&var).copied()
    }

    pub fn valency(&self, var: u64) -> Option<u16> {
        self.position(var).map(|i| self.shape[i])
    }

    pub fn value(&self, j: usize, var: u64) -> Option<u8> {
        self.position(var).map(|i| self.values[j * self.vars.len() + i])
    }

    /// Copy `row` into slot `j`. A row whose variable list differs from this
    /// history's is matched by id; unmatched slots are zeroed.
    pub fn write(&mut self, j: usize, row: &DenseRow) {
        let n = self.vars.len();
        let dest = &mut self.values[j * n..(j + 1) * n];
        if row.vars == self.vars && row.values.len() == n {
            dest.copy_from_slice(&row.values);
            return;
        }
        dest.iter_mut().for_each(|x| *x = 0);
        for (v, x) in row.vars.iter().zip(row.values.iter()) {
            if let Some(&i) = self.index.get(v) {
                dest[i] = *x;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistorySparse {
    values: Vec<u64>,
}

impl HistorySparse {
    pub fn new(size: usize) -> Self {
        Self { values: vec![0; size] }
    }

    pub fn with_values(values: Vec<u64>) -> Self {
        Self { values }
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn value(&self, j: usize) -> u64 {
        self.values[j]
    }

    pub fn values(&self) -> &[u64] {
        &self.values
    }

    pub fn write(&mut self, j: usize, row: &SparseRow) -> u64 {
        let v = row.value();
        self.values[j] = v;
        v
    }
}

/// Shape of one dense source, used to build a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenseSpec {
    pub vars: Vec<u64>,
    pub shape: Vec<u16>,
}

impl DenseSpec {
    pub fn new(vars: Vec<u64>, shape: Vec<u16>) -> Self {
        Self { vars, shape }
    }

    pub fn from_row(row: &DenseRow) -> Self {
        Self::new(row.vars.clone(), row.shape.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    size: usize,
    /// Rows written in the current pass, `0..=size`. The wrap to row 0
    /// happens when the next row arrives.
    pub(crate) cursor: usize,
    pub(crate) overflow: bool,
    pub(crate) dense: Vec<HistoryDense>,
    pub(crate) sparse: Vec<HistorySparse>,
    /// Ancestor chain (general to specific, excluding the value) of every
    /// sparse value seen with more than one level.
    pub(crate) paths: HashMap<u64, Vec<u64>>,
    pub(crate) path_len_max: usize,
}

impl Window {
    pub fn new(size: usize, dense: &[DenseSpec], sparse: usize) -> Result<Self> {
        if size == 0 || size > WINDOW_MAX {
            return Err(ActiveError::Inconsistent(format!("window size {} outside 1..={}", size, WINDOW_MAX)));
        }
        let dense = dense
            .iter()
            .map(|d| HistoryDense::new(d.vars.clone(), d.shape.clone(), size))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            size,
            cursor: 0,
            overflow: false,
            dense,
            sparse: (0..sparse).map(|_| HistorySparse::new(size)).collect(),
            paths: HashMap::new(),
            path_len_max: 1,
        })
    }

    pub(crate) fn from_parts(
        size: usize,
        cursor: usize,
        overflow: bool,
        dense: Vec<HistoryDense>,
        sparse: Vec<HistorySparse>,
        paths: HashMap<u64, Vec<u64>>,
    ) -> Result<Self> {
        let window = Self {
            size,
            cursor,
            overflow,
            dense,
            sparse,
            path_len_max: paths.values().map(|p| p.len() + 1).max().unwrap_or(1),
            paths,
        };
        window.check()?;
        Ok(window)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Next row to overwrite.
    pub fn cursor(&self) -> usize {
        self.cursor % self.size
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn dense(&self) -> &[HistoryDense] {
        &self.dense
    }

    pub fn sparse(&self) -> &[HistorySparse] {
        &self.sparse
    }

    pub fn path_len_max(&self) -> usize {
        self.path_len_max
    }

    pub fn paths(&self) -> &HashMap<u64, Vec<u64>> {
        &self.paths
    }

    /// Sizes and cursor agree across every source.
    pub fn check(&self) -> Result<()> {
        if self.cursor > self.size || (self.overflow && self.cursor == 0) {
            return Err(ActiveError::Inconsistent(format!(
                "cursor {} outside window of {}",
                self.cursor, self.size
            )));
        }
        for (h, hr) in self.dense.iter().enumerate() {
            if hr.size() != self.size || hr.dimension() == 0 {
                return Err(ActiveError::Inconsistent(format!(
                    "dense source {} has size {} dimension {}, window is {}",
                    h,
                    hr.size(),
                    hr.dimension(),
                    self.size
                )));
            }
        }
        for (h, hr) in self.sparse.iter().enumerate() {
            if hr.size() != self.size {
                return Err(ActiveError::Inconsistent(format!(
                    "sparse source {} has size {}, window is {}",
                    h,
                    hr.size(),
                    self.size
                )));
            }
        }
        Ok(())
    }

    pub fn populated(&self) -> usize {
        if self.overflow {
            self.size
        } else {
            self.cursor
        }
    }

    pub fn is_populated(&self, j: usize) -> bool {
        j < self.size && (self.overflow || j < self.cursor)
    }

    /// The next admission overwrites a populated row.
    pub fn replaces(&self) -> bool {
        self.populated() == self.size
    }

    /// Most recently admitted row.
    pub fn newest(&self) -> Option<usize> {
        if self.populated() == 0 {
            None
        } else {
            Some((self.cursor + self.size - 1) % self.size)
        }
    }

    fn oldest(&self) -> usize {
        if self.overflow {
            self.cursor % self.size
        } else {
            0
        }
    }

    /// Number of populated rows older than `j`.
    pub fn age(&self, j: usize) -> usize {
        (j + self.size - self.oldest()) % self.size
    }

    /// Row `lag` admissions before `j`, if it is still in the window.
    pub fn lagged(&self, j: usize, lag: usize) -> Option<usize> {
        if !self.is_populated(j) || lag > self.age(j) {
            return None;
        }
        Some((j + self.size - lag % self.size) % self.size)
    }

    /// Rows in admission order, oldest first.
    pub fn rows_in_order(&self) -> Vec<usize> {
        let start = self.oldest();
        (0..self.populated()).map(|k| (start + k) % self.size).collect()
    }

    /// Merge one event from every source into the next row and advance the
    /// cursor. Returns the row written. Overflow is raised by the first
    /// admission that overwrites a row.
    pub fn admit(&mut self, dense: &[&DenseRow], sparse: &[&SparseRow]) -> Result<usize> {
        if dense.len() != self.dense.len() || sparse.len() != self.sparse.len() {
            return Err(ActiveError::Inconsistent(format!(
                "event has {} dense and {} sparse rows, window expects {} and {}",
                dense.len(),
                sparse.len(),
                self.dense.len(),
                self.sparse.len()
            )));
        }
        if let Some(bad) = dense.iter().position(|r| !r.is_consistent()) {
            return Err(ActiveError::Inconsistent(format!("dense row {} malformed", bad)));
        }
        if self.cursor >= self.size {
            self.cursor = 0;
            self.overflow = true;
        }
        let j = self.cursor;
        for (hr, row) in self.dense.iter_mut().zip(dense.iter()) {
            hr.write(j, row);
        }
        for (hr, row) in self.sparse.iter_mut().zip(sparse.iter()) {
            let v = hr.write(j, row);
            if v != 0 && row.capacity() > 1 && !self.paths.contains_key(&v) {
                self.paths.insert(v, row.ancestors());
                self.path_len_max = self.path_len_max.max(row.capacity());
            }
        }
        self.cursor += 1;
        Ok(j)
    }

    /// Value and valency of a dense variable at row `j`.
    pub fn dense_value(&self, j: usize, var: u64) -> Option<(u8, u16)> {
        self.dense.iter().find_map(|hr| {
            hr.position(var)
                .map(|i| (hr.values[j * hr.dimension() + i], hr.shape[i]))
        })
    }

    pub fn valency(&self, var: u64) -> Option<u16> {
        self.dense.iter().find_map(|hr| hr.valency(var))
    }

    pub fn sparse_values(&self, j: usize) -> impl Iterator<Item = u64> + '_ {
        self.sparse.iter().map(move |hr| hr.value(j)).filter(|v| *v != 0)
    }

    pub fn ancestors(&self, v: u64) -> &[u64] {
        self.paths.get(&v).map(|p| p.as_slice()).unwrap_or(&[])
    }

    /// 1 if any sparse source at `j` holds `v` or a descendant of `v`.
    pub fn sparse_presence(&self, j: usize, v: u64) -> u8 {
        let hit = self
            .sparse_values(j)
            .any(|x| x == v || self.ancestors(x).contains(&v));
        hit as u8
    }
}
