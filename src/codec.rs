//! Binary persistence of an engine.
//!
//! Little-endian, fields in a fixed order, lengths as `u64` prefixes. The
//! last three sections (frames, caches, failures) may be missing from older
//! streams; a clean end of stream at the start of one of them leaves its
//! defaults in place.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use crate::active::{Active, ActiveState};
use crate::config::{FrameConfig, InduceParams};
use crate::decomp::{Cell, Decomp, FudNode};
use crate::error::{ActiveError, Result};
use crate::frames::{FrameKind, Frames, Promotion};
use crate::fud::{Fud, Transform};
use crate::history::{DenseSpec, HistoryDense, HistorySparse, Window, WINDOW_MAX};
use crate::logging::{obj, v_str, Domain};
use crate::slices::SliceTable;
use crate::system::{SystemState, VarBlock};

/// Upper bound on any length prefix, to fail fast on garbage input.
const LEN_MAX: u64 = 1 << 32;
const NO_ROW: u64 = u64::MAX;

pub fn state_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn put_len<W: Write>(w: &mut W, n: usize) -> io::Result<()> {
    w.write_u64::<LittleEndian>(n as u64)
}

fn put_u64s<W: Write>(w: &mut W, xs: &[u64]) -> io::Result<()> {
    put_len(w, xs.len())?;
    for x in xs {
        w.write_u64::<LittleEndian>(*x)?;
    }
    Ok(())
}

fn put_bytes<W: Write>(w: &mut W, xs: &[u8]) -> io::Result<()> {
    put_len(w, xs.len())?;
    w.write_all(xs)
}

fn put_usizes<W: Write>(w: &mut W, xs: &[usize]) -> io::Result<()> {
    put_len(w, xs.len())?;
    for x in xs {
        w.write_u64::<LittleEndian>(*x as u64)?;
    }
    Ok(())
}

fn get_len<R: Read>(r: &mut R) -> Result<usize> {
    let n = r.read_u64::<LittleEndian>()?;
    if n > LEN_MAX {
        return Err(ActiveError::Format(format!("length {} out of range", n)));
    }
    Ok(n as usize)
}

fn get_u64s<R: Read>(r: &mut R) -> Result<Vec<u64>> {
    let n = get_len(r)?;
    let mut out = Vec::with_capacity(n.min(1 << 16));
    for _ in 0..n {
        out.push(r.read_u64::<LittleEndian>()?);
    }
    Ok(out)
}

fn get_usizes<R: Read>(r: &mut R) -> Result<Vec<usize>> {
    Ok(get_u64s(r)?.into_iter().map(|x| x as usize).collect())
}

fn get_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let n = get_len(r)?;
    let mut out = Vec::with_capacity(n.min(1 << 16));
    r.take(n as u64).read_to_end(&mut out)?;
    if out.len() != n {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, format!("{} of {} bytes", out.len(), n)).into());
    }
    Ok(out)
}

fn get_bool<R: Read>(r: &mut R) -> Result<bool> {
    match r.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        x => Err(ActiveError::Format(format!("bad flag byte {}", x))),
    }
}

/// First word of an optional section, or `None` at a clean end of stream.
fn opt_u64<R: Read>(r: &mut R) -> Result<Option<u64>> {
    let mut buf = [0u8; 8];
    let mut got = 0;
    while got < buf.len() {
        match r.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    match got {
        0 => Ok(None),
        8 => Ok(Some(LittleEndian::read_u64(&buf))),
        _ => Err(ActiveError::Format("truncated optional section".to_string())),
    }
}

fn put_fud<W: Write>(w: &mut W, fud: &Fud) -> io::Result<()> {
    put_len(w, fud.transforms.len())?;
    for t in &fud.transforms {
        w.write_u64::<LittleEndian>(t.derived)?;
        w.write_u16::<LittleEndian>(t.valency)?;
        put_u64s(w, &t.inputs)?;
        put_len(w, t.table.len())?;
        for (key, value) in &t.table {
            put_bytes(w, key)?;
            w.write_u8(*value)?;
        }
    }
    Ok(())
}

fn get_fud<R: Read>(r: &mut R) -> Result<Fud> {
    let n = get_len(r)?;
    let mut transforms = Vec::with_capacity(n.min(1 << 10));
    for _ in 0..n {
        let derived = r.read_u64::<LittleEndian>()?;
        let valency = r.read_u16::<LittleEndian>()?;
        let inputs = get_u64s(r)?;
        let entries = get_len(r)?;
        let mut table = BTreeMap::new();
        for _ in 0..entries {
            let key = get_bytes(r)?;
            if key.len() != inputs.len() {
                return Err(ActiveError::Format(format!(
                    "transform {} key of {} bytes for {} inputs",
                    derived,
                    key.len(),
                    inputs.len()
                )));
            }
            table.insert(key, r.read_u8()?);
        }
        transforms.push(Transform::new(derived, valency, inputs, table));
    }
    Ok(Fud::new(transforms))
}

fn put_params<W: Write>(w: &mut W, p: &InduceParams) -> io::Result<()> {
    put_usizes(w, &p.thresholds)?;
    put_u64s(w, &p.exclusions.iter().copied().collect::<Vec<_>>())?;
    put_u64s(w, &p.computed.iter().copied().collect::<Vec<_>>())?;
    w.write_f64::<LittleEndian>(p.znnmax)?;
    w.write_u64::<LittleEndian>(p.bmax as u64)?;
    match p.candidates_max {
        Some(n) => {
            w.write_u8(1)?;
            w.write_u64::<LittleEndian>(n as u64)?;
        }
        None => w.write_u8(0)?,
    }
    w.write_f64::<LittleEndian>(p.density_min)?;
    w.write_u64::<LittleEndian>(p.seed)?;
    w.write_u16::<LittleEndian>(p.wmax)
}

/// Persisted parameters over `base`; scheduling options stay as configured.
fn get_params<R: Read>(r: &mut R, base: &InduceParams) -> Result<InduceParams> {
    let thresholds = get_usizes(r)?;
    let exclusions = get_u64s(r)?.into_iter().collect();
    let computed = get_u64s(r)?.into_iter().collect();
    let znnmax = r.read_f64::<LittleEndian>()?;
    let bmax = r.read_u64::<LittleEndian>()? as usize;
    let candidates_max = if get_bool(r)? {
        Some(r.read_u64::<LittleEndian>()? as usize)
    } else {
        None
    };
    let density_min = r.read_f64::<LittleEndian>()?;
    let seed = r.read_u64::<LittleEndian>()?;
    let wmax = r.read_u16::<LittleEndian>()?;
    Ok(InduceParams {
        thresholds,
        exclusions,
        computed,
        znnmax,
        bmax,
        candidates_max,
        density_min,
        seed,
        wmax,
        ..base.clone()
    }
    .normalized())
}

pub(crate) fn write_state<W: Write>(w: &mut W, name: &str, st: &ActiveState, system: SystemState) -> io::Result<()> {
    write_core(w, name, st, system)?;
    write_frames(w, &st.frames)?;
    write_slice_extras(w, st)
}

fn write_core<W: Write>(w: &mut W, name: &str, st: &ActiveState, system: SystemState) -> io::Result<()> {
    put_bytes(w, name.as_bytes())?;
    match st.last_updated() {
        Some(id) => {
            w.write_u8(1)?;
            w.write_u64::<LittleEndian>(id)?;
        }
        None => w.write_u8(0)?,
    }

    let window = &st.window;
    let populated = window.populated();
    w.write_u64::<LittleEndian>(window.size() as u64)?;
    w.write_u8(window.overflow() as u8)?;
    w.write_u64::<LittleEndian>(window.cursor as u64)?;
    put_len(w, window.dense().len())?;
    for hr in window.dense() {
        put_u64s(w, hr.vars())?;
        put_len(w, hr.shape().len())?;
        for s in hr.shape() {
            w.write_u16::<LittleEndian>(*s)?;
        }
        put_bytes(w, &hr.values()[..populated * hr.dimension()])?;
    }
    put_len(w, window.sparse().len())?;
    for hr in window.sparse() {
        put_u64s(w, &hr.values()[..populated])?;
    }
    let mut paths: Vec<(&u64, &Vec<u64>)> = window.paths().iter().collect();
    paths.sort();
    put_len(w, paths.len())?;
    for (v, chain) in paths {
        w.write_u64::<LittleEndian>(*v)?;
        put_u64s(w, chain)?;
    }

    put_len(w, st.decomp.len())?;
    for node in st.decomp.nodes() {
        w.write_u64::<LittleEndian>(node.parent)?;
        put_fud(w, &node.fud)?;
        put_u64s(w, &node.derived)?;
        put_len(w, node.cells.len())?;
        for cell in &node.cells {
            put_bytes(w, &cell.values)?;
            w.write_u64::<LittleEndian>(cell.child)?;
        }
        w.write_u64::<LittleEndian>(node.remainder)?;
    }

    w.write_u32::<LittleEndian>(system.bits)?;
    w.write_u64::<LittleEndian>(system.block)?;
    w.write_u64::<LittleEndian>(st.var_block.next)?;
    w.write_u64::<LittleEndian>(st.slice_block.next)?;

    put_params(w, &st.params)?;

    put_u64s(w, &st.slices.tags()[..populated])
}

fn write_frames<W: Write>(w: &mut W, frames: &Frames) -> io::Result<()> {
    put_usizes(w, &frames.config.underlying)?;
    put_usizes(w, &frames.config.history)?;
    w.write_u8(frames.config.dynamic as u8)?;
    let promotions = frames.promotions();
    put_len(w, promotions.len())?;
    for p in &promotions {
        w.write_u8(p.kind.as_u8())?;
        w.write_u64::<LittleEndian>(p.lag as u64)?;
        w.write_u64::<LittleEndian>(p.raw_block)?;
        w.write_u64::<LittleEndian>(p.block)?;
    }
    let run_prev: Vec<u64> = frames.run_prev().iter().map(|r| r.map_or(NO_ROW, |x| x as u64)).collect();
    put_u64s(w, &run_prev)
}

fn write_slice_extras<W: Write>(w: &mut W, st: &ActiveState) -> io::Result<()> {
    let cumulative = st.slices.cumulative();
    let transitions = st.slices.transitions();
    let flags = cumulative.is_some() as u64 | ((transitions.is_some() as u64) << 1);
    w.write_u64::<LittleEndian>(flags)?;
    if let Some(c) = cumulative {
        let mut entries: Vec<(&u64, &usize)> = c.iter().collect();
        entries.sort();
        put_len(w, entries.len())?;
        for (s, n) in entries {
            w.write_u64::<LittleEndian>(*s)?;
            w.write_u64::<LittleEndian>(*n as u64)?;
        }
    }
    if let Some(t) = transitions {
        let mut entries: Vec<(&(u64, u64), &usize)> = t.iter().collect();
        entries.sort();
        put_len(w, entries.len())?;
        for ((a, b), n) in entries {
            w.write_u64::<LittleEndian>(*a)?;
            w.write_u64::<LittleEndian>(*b)?;
            w.write_u64::<LittleEndian>(*n as u64)?;
        }
    }

    let mut failures: Vec<(&u64, &usize)> = st.slices.failures().iter().collect();
    failures.sort();
    put_len(w, failures.len())?;
    for (s, n) in failures {
        w.write_u64::<LittleEndian>(*s)?;
        w.write_u64::<LittleEndian>(*n as u64)?;
    }
    w.write_u64::<LittleEndian>(st.discontinuities)
}

pub(crate) struct Decoded {
    pub name: String,
    pub state: ActiveState,
    pub system: SystemState,
}

pub(crate) fn read_state<R: Read>(r: &mut R, active: &Active, base: &InduceParams) -> Result<Decoded> {
    let name = String::from_utf8(get_bytes(r)?).map_err(|e| ActiveError::Format(format!("name: {}", e)))?;
    let last = if get_bool(r)? {
        Some(r.read_u64::<LittleEndian>()?)
    } else {
        None
    };

    let size = r.read_u64::<LittleEndian>()?;
    if size == 0 || size > WINDOW_MAX as u64 {
        return Err(ActiveError::Format(format!("window size {} outside 1..={}", size, WINDOW_MAX)));
    }
    let size = size as usize;
    let overflow = get_bool(r)?;
    let cursor = r.read_u64::<LittleEndian>()? as usize;
    if cursor > size || (overflow && cursor == 0) {
        return Err(ActiveError::Format(format!("cursor {} outside window of {}", cursor, size)));
    }
    let populated = if overflow { size } else { cursor };
    let dense_count = get_len(r)?;
    if dense_count != active.dense_specs.len() {
        return Err(ActiveError::Format(format!(
            "saved state has {} dense sources, engine has {}",
            dense_count,
            active.dense_specs.len()
        )));
    }
    let mut dense = Vec::with_capacity(dense_count);
    for expected in &active.dense_specs {
        let vars = get_u64s(r)?;
        let n = get_len(r)?;
        let mut shape = Vec::with_capacity(n.min(1 << 16));
        for _ in 0..n {
            shape.push(r.read_u16::<LittleEndian>()?);
        }
        if vars != expected.vars || shape != expected.shape {
            return Err(ActiveError::Format(format!(
                "saved dense source {:?} does not match engine source {:?}",
                vars, expected.vars
            )));
        }
        let mut values = get_bytes(r)?;
        if values.len() != populated * vars.len() {
            return Err(ActiveError::Format(format!(
                "dense history has {} bytes, expected {}",
                values.len(),
                populated * vars.len()
            )));
        }
        values.resize(size * vars.len(), 0);
        dense.push(HistoryDense::with_values(vars, shape, size, values).map_err(format_error)?);
    }
    let sparse_count = get_len(r)?;
    if sparse_count != active.sparse_stores.len() {
        return Err(ActiveError::Format(format!(
            "saved state has {} sparse sources, engine has {}",
            sparse_count,
            active.sparse_stores.len()
        )));
    }
    let mut sparse = Vec::with_capacity(sparse_count);
    for _ in 0..sparse_count {
        let mut values = get_u64s(r)?;
        if values.len() != populated {
            return Err(ActiveError::Format(format!(
                "sparse history has {} rows, expected {}",
                values.len(),
                populated
            )));
        }
        values.resize(size, 0);
        sparse.push(HistorySparse::with_values(values));
    }
    let path_count = get_len(r)?;
    let mut paths = HashMap::with_capacity(path_count.min(1 << 16));
    for _ in 0..path_count {
        let v = r.read_u64::<LittleEndian>()?;
        paths.insert(v, get_u64s(r)?);
    }
    let window = Window::from_parts(size, cursor, overflow, dense, sparse, paths).map_err(format_error)?;

    let node_count = get_len(r)?;
    let mut nodes = Vec::with_capacity(node_count.min(1 << 16));
    for _ in 0..node_count {
        let parent = r.read_u64::<LittleEndian>()?;
        let fud = get_fud(r)?;
        let derived = get_u64s(r)?;
        let cell_count = get_len(r)?;
        let mut cells = Vec::with_capacity(cell_count.min(1 << 16));
        for _ in 0..cell_count {
            let values = get_bytes(r)?;
            let child = r.read_u64::<LittleEndian>()?;
            cells.push(Cell { values, child });
        }
        let remainder = r.read_u64::<LittleEndian>()?;
        nodes.push(FudNode { parent, fud, derived, cells, remainder });
    }
    let decomp = Decomp::from_nodes(nodes).map_err(format_error)?;

    let system = SystemState {
        bits: r.read_u32::<LittleEndian>()?,
        block: r.read_u64::<LittleEndian>()?,
    };
    let var_block = VarBlock { next: r.read_u64::<LittleEndian>()? };
    let slice_block = VarBlock { next: r.read_u64::<LittleEndian>()? };

    let params = get_params(r, base)?;

    let mut tags = get_u64s(r)?;
    if tags.len() != populated {
        return Err(ActiveError::Format(format!("{} slice tags for {} rows", tags.len(), populated)));
    }
    tags.resize(size, 0);

    let config = &active.config;
    let frames = match opt_u64(r)? {
        None => Frames::new(config.frames.clone(), size, system.bits),
        Some(n) => {
            if n > LEN_MAX {
                return Err(ActiveError::Format(format!("length {} out of range", n)));
            }
            let mut underlying = Vec::with_capacity(n as usize);
            for _ in 0..n {
                underlying.push(r.read_u64::<LittleEndian>()? as usize);
            }
            let history = get_usizes(r)?;
            let dynamic = get_bool(r)?;
            let count = get_len(r)?;
            let mut promotions = Vec::with_capacity(count.min(1 << 16));
            for _ in 0..count {
                let kind = r.read_u8()?;
                let kind = FrameKind::from_u8(kind)
                    .ok_or_else(|| ActiveError::Format(format!("bad frame kind {}", kind)))?;
                promotions.push(Promotion {
                    kind,
                    lag: r.read_u64::<LittleEndian>()? as usize,
                    raw_block: r.read_u64::<LittleEndian>()?,
                    block: r.read_u64::<LittleEndian>()?,
                });
            }
            let run_prev: Vec<Option<usize>> = get_u64s(r)?
                .into_iter()
                .map(|x| (x != NO_ROW).then_some(x as usize))
                .collect();
            if run_prev.len() != size {
                return Err(ActiveError::Format(format!("{} run links for a window of {}", run_prev.len(), size)));
            }
            Frames::from_parts(FrameConfig { underlying, history, dynamic }, system.bits, promotions, run_prev)
        }
    };

    let mut slices = SliceTable::new(size, &params.thresholds, config.cache_cumulative, config.cache_transitions);
    slices.rebuild(&window, &decomp, tags)?;

    let mut discontinuities = 0;
    if let Some(flags) = opt_u64(r)? {
        let cumulative = if flags & 1 != 0 {
            let n = get_len(r)?;
            let mut c = HashMap::with_capacity(n.min(1 << 16));
            for _ in 0..n {
                let s = r.read_u64::<LittleEndian>()?;
                c.insert(s, r.read_u64::<LittleEndian>()? as usize);
            }
            Some(c)
        } else {
            None
        };
        let transitions = if flags & 2 != 0 {
            let n = get_len(r)?;
            let mut t = HashMap::with_capacity(n.min(1 << 16));
            for _ in 0..n {
                let a = r.read_u64::<LittleEndian>()?;
                let b = r.read_u64::<LittleEndian>()?;
                t.insert((a, b), r.read_u64::<LittleEndian>()? as usize);
            }
            Some(t)
        } else {
            None
        };
        slices.set_caches(cumulative, transitions);

        if let Some(n) = opt_u64(r)? {
            if n > LEN_MAX {
                return Err(ActiveError::Format(format!("length {} out of range", n)));
            }
            let mut failures = HashMap::with_capacity(n as usize);
            for _ in 0..n {
                let s = r.read_u64::<LittleEndian>()?;
                failures.insert(s, r.read_u64::<LittleEndian>()? as usize);
            }
            slices.set_failures(failures);
            discontinuities = r.read_u64::<LittleEndian>()?;
        }
    }
    slices.set_thresholds(&decomp, &params.thresholds);

    let state = ActiveState {
        window,
        slices,
        decomp,
        frames,
        updated: last.into_iter().collect(),
        var_block,
        slice_block,
        params,
        in_progress: BTreeSet::new(),
        discontinuities,
    };
    Ok(Decoded { name, state, system })
}

/// Source shapes recorded at the head of a saved state: enough to build an
/// engine that can load it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub name: String,
    pub last_event: Option<u64>,
    pub history_size: usize,
    pub dense: Vec<DenseSpec>,
    pub sparse: usize,
}

pub fn read_layout<R: Read>(r: &mut R) -> Result<Layout> {
    let name = String::from_utf8(get_bytes(r)?).map_err(|e| ActiveError::Format(format!("name: {}", e)))?;
    let last_event = if get_bool(r)? {
        Some(r.read_u64::<LittleEndian>()?)
    } else {
        None
    };
    let history_size = r.read_u64::<LittleEndian>()?;
    if history_size == 0 || history_size > WINDOW_MAX as u64 {
        return Err(ActiveError::Format(format!("window size {} outside 1..={}", history_size, WINDOW_MAX)));
    }
    let history_size = history_size as usize;
    let _overflow = get_bool(r)?;
    let _cursor = r.read_u64::<LittleEndian>()?;
    let count = get_len(r)?;
    let mut dense = Vec::with_capacity(count.min(1 << 10));
    for _ in 0..count {
        let vars = get_u64s(r)?;
        let n = get_len(r)?;
        let mut shape = Vec::with_capacity(n.min(1 << 16));
        for _ in 0..n {
            shape.push(r.read_u16::<LittleEndian>()?);
        }
        get_bytes(r)?;
        dense.push(DenseSpec::new(vars, shape));
    }
    let sparse = get_len(r)?;
    Ok(Layout { name, last_event, history_size, dense, sparse })
}

/// Structural problems found while decoding are format errors, not engine
/// inconsistencies.
fn format_error(e: ActiveError) -> ActiveError {
    match e {
        ActiveError::Inconsistent(msg) => ActiveError::Format(msg),
        other => other,
    }
}

impl Active {
    /// Encoded state, taken under the engine lock.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let st = self.state.lock();
        let mut buf = Vec::new();
        write_state(&mut buf, &self.name, &st, self.system.state())?;
        Ok(buf)
    }

    pub fn state_digest(&self) -> Result<String> {
        Ok(state_digest(&self.encode()?))
    }

    /// Write the engine to `w`. Returns the number of bytes written.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<u64> {
        let bytes = self.encode()?;
        if let Err(e) = w.write_all(&bytes).and_then(|_| w.flush()) {
            return Err(self.fail(Domain::Codec, "save", e.into()));
        }
        self.log
            .checkpoint(&self.name, &state_digest(&bytes), bytes.len() as u64, self.last_event());
        Ok(bytes.len() as u64)
    }

    pub fn save_path(&self, path: &Path) -> Result<u64> {
        let file = File::create(path).map_err(|e| self.fail(Domain::Codec, "save", e.into()))?;
        let mut w = BufWriter::new(file);
        self.save(&mut w)
    }

    /// Replace the engine state with one read from `r`. On any error the
    /// current state is left untouched.
    pub fn load<R: Read>(&self, r: &mut R) -> Result<()> {
        let base = self.params();
        let decoded = read_state(r, self, &base).map_err(|e| match e {
            ActiveError::Io(io) if io.kind() == ErrorKind::UnexpectedEof => {
                ActiveError::Format(format!("truncated state: {}", io))
            }
            other => other,
        });
        let decoded = match decoded {
            Ok(d) => d,
            Err(e) => return Err(self.fail(Domain::Codec, "load", e)),
        };
        if decoded.system.bits != self.system.bits() {
            let e = ActiveError::Format(format!(
                "saved state uses {}-bit blocks, allocator has {}",
                decoded.system.bits,
                self.system.bits()
            ));
            return Err(self.fail(Domain::Codec, "load", e));
        }
        if decoded.name != self.name {
            self.log.warn(
                Domain::Codec,
                "name_mismatch",
                obj(&[("name", v_str(&self.name)), ("saved", v_str(&decoded.name))]),
            );
        }
        self.system.restore(decoded.system);
        *self.state.lock() = decoded.state;
        self.log.info(Domain::Codec, "loaded", obj(&[("name", v_str(&self.name))]));
        Ok(())
    }

    pub fn load_path(&self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|e| self.fail(Domain::Codec, "load", e.into()))?;
        let mut r = BufReader::new(file);
        self.load(&mut r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActiveConfig;
    use crate::kernel::StubKernel;
    use crate::logging::{Logger, MemorySink};
    use crate::store::{DenseRow, DenseStore, SparseRow, SparseStore};
    use std::sync::Arc;

    fn engine(mem: Arc<MemorySink>) -> (Arc<Active>, Arc<DenseStore>, Arc<SparseStore>) {
        let dense = DenseStore::shared("dense0", 0);
        let sparse = SparseStore::shared("sparse0", 0);
        let config = ActiveConfig { cache_transitions: true, ..ActiveConfig::default() }.with_history(8);
        let a = Active::builder(config)
            .params(InduceParams::default().with_thresholds(&[4]))
            .kernel(Arc::new(StubKernel::new(1)))
            .logger(Logger::new(mem))
            .dense(dense.clone(), DenseSpec::new(vec![1], vec![2]))
            .sparse(sparse.clone())
            .build()
            .unwrap();
        (Arc::new(a), dense, sparse)
    }

    fn feed(a: &Active, dense: &DenseStore, sparse: &SparseStore, ids: std::ops::RangeInclusive<u64>) {
        for id in ids {
            dense.insert(id, DenseRow::new(vec![1], vec![2], vec![(id % 2) as u8]));
            sparse.insert(id, SparseRow::new(vec![100 + id % 3]));
        }
        a.update().unwrap();
    }

    #[test]
    fn test_round_trip_reproduces_state() {
        let (a, dense, sparse) = engine(Arc::new(MemorySink::new()));
        feed(&a, &dense, &sparse, 1..=5);
        a.induce_sync().unwrap();
        let bytes = a.encode().unwrap();

        let (b, _, _) = engine(Arc::new(MemorySink::new()));
        b.load(&mut bytes.as_slice()).unwrap();
        assert_eq!(b.encode().unwrap(), bytes);
        assert_eq!(b.children(0), a.children(0));
        for j in 0..8 {
            assert_eq!(b.slice_of(j), a.slice_of(j));
        }
        assert_eq!(b.last_event(), Some(5));
        assert_eq!(b.transition_count(0, 0), a.transition_count(0, 0));
    }

    #[test]
    fn test_missing_optional_sections_default() {
        let (a, dense, sparse) = engine(Arc::new(MemorySink::new()));
        feed(&a, &dense, &sparse, 1..=3);
        let mut core = Vec::new();
        {
            let st = a.state.lock();
            write_core(&mut core, a.name(), &st, a.system().state()).unwrap();
        }
        let (b, _, _) = engine(Arc::new(MemorySink::new()));
        b.load(&mut core.as_slice()).unwrap();
        for j in 0..3 {
            assert_eq!(b.slice_of(j), Some(0));
        }
        assert_eq!(b.last_event(), Some(3));
        // transitions rebuilt from the row tags
        assert_eq!(b.transition_count(0, 0), Some(2));
    }

    #[test]
    fn test_truncated_load_leaves_state() {
        let (a, dense, sparse) = engine(Arc::new(MemorySink::new()));
        feed(&a, &dense, &sparse, 1..=3);
        let bytes = a.encode().unwrap();
        let (b, bd, bs) = engine(Arc::new(MemorySink::new()));
        feed(&b, &bd, &bs, 1..=1);
        let before = b.encode().unwrap();
        let err = b.load(&mut &bytes[..20]).unwrap_err();
        assert_eq!(err.kind(), "format");
        assert!(!b.is_terminated());
        assert_eq!(b.encode().unwrap(), before);
    }

    #[test]
    fn test_save_logs_checkpoint() {
        let mem = Arc::new(MemorySink::new());
        let (a, dense, sparse) = engine(mem.clone());
        feed(&a, &dense, &sparse, 1..=2);
        let mut out = Vec::new();
        let n = a.save(&mut out).unwrap();
        assert_eq!(n as usize, out.len());
        assert_eq!(mem.count("checkpoint"), 1);
        assert_eq!(a.state_digest().unwrap(), state_digest(&out));
        assert_eq!(state_digest(&out).len(), 64);
    }

    #[test]
    fn test_oversized_window_rejected_before_allocation() {
        let (a, _, _) = engine(Arc::new(MemorySink::new()));
        let mut bytes = a.encode().unwrap();
        // name, absent last-id flag, then the window size
        let at = 8 + a.name().len() + 1;
        bytes[at..at + 8].copy_from_slice(&(1u64 << 32).to_le_bytes());

        let (b, bd, bs) = engine(Arc::new(MemorySink::new()));
        feed(&b, &bd, &bs, 1..=2);
        let before = b.encode().unwrap();
        let err = b.load(&mut bytes.as_slice()).unwrap_err();
        assert_eq!(err.kind(), "format");
        assert!(!b.is_terminated());
        assert_eq!(b.encode().unwrap(), before);
        assert_eq!(read_layout(&mut bytes.as_slice()).unwrap_err().kind(), "format");
    }

    #[test]
    fn test_long_length_prefix_is_truncation() {
        let mut bytes = Vec::new();
        bytes.write_u64::<LittleEndian>(1 << 31).unwrap();
        bytes.extend_from_slice(b"active");
        let (b, _, _) = engine(Arc::new(MemorySink::new()));
        assert_eq!(b.load(&mut bytes.as_slice()).unwrap_err().kind(), "format");
    }

    #[test]
    fn test_dense_shape_mismatch_rejected() {
        let (a, dense, sparse) = engine(Arc::new(MemorySink::new()));
        feed(&a, &dense, &sparse, 1..=3);
        let bytes = a.encode().unwrap();
        let b = Active::builder(ActiveConfig::default().with_history(8))
            .logger(Logger::new(Arc::new(MemorySink::new())))
            .dense(DenseStore::shared("dense0", 0), DenseSpec::new(vec![1], vec![3]))
            .sparse(SparseStore::shared("sparse0", 0))
            .build()
            .unwrap();
        assert_eq!(b.load(&mut bytes.as_slice()).unwrap_err().kind(), "format");
        assert_eq!(b.last_event(), None);
    }

    #[test]
    fn test_layout_from_head() {
        let (a, dense, sparse) = engine(Arc::new(MemorySink::new()));
        feed(&a, &dense, &sparse, 1..=2);
        let bytes = a.encode().unwrap();
        let layout = read_layout(&mut bytes.as_slice()).unwrap();
        assert_eq!(layout.name, "active");
        assert_eq!(layout.last_event, Some(2));
        assert_eq!(layout.history_size, 8);
        assert_eq!(layout.dense, vec![DenseSpec::new(vec![1], vec![2])]);
        assert_eq!(layout.sparse, 1);
    }
}
