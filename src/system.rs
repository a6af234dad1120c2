//! Process-wide block allocator for variable ids.
//!
//! Blocks are `2^bits` ids wide. Block 0 is never issued so that id 0 stays
//! free for the root slice.

use parking_lot::Mutex;

use crate::error::{ActiveError, Result};
use crate::variable::offset_of;

/// Widest block; bit 63 is the computed-variable flag.
pub const BITS_MAX: u32 = 62;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemState {
    pub bits: u32,
    pub block: u64,
}

#[derive(Debug)]
pub struct ActiveSystem {
    inner: Mutex<SystemState>,
}

impl Default for ActiveSystem {
    fn default() -> Self {
        Self::new(16)
    }
}

impl ActiveSystem {
    /// `bits` is clamped to `1..=BITS_MAX`.
    pub fn new(bits: u32) -> Self {
        Self {
            inner: Mutex::new(SystemState { bits: bits.clamp(1, BITS_MAX), block: 1 }),
        }
    }

    pub fn bits(&self) -> u32 {
        self.inner.lock().bits
    }

    pub fn state(&self) -> SystemState {
        *self.inner.lock()
    }

    /// Never moves the allocator backwards, so a loaded engine cannot be
    /// handed ids another engine in this process already holds.
    pub fn restore(&self, state: SystemState) {
        let mut inner = self.inner.lock();
        if state.bits == inner.bits {
            inner.block = inner.block.max(state.block);
        } else if state.bits > inner.bits {
            let shift = state.bits - inner.bits;
            let wanted = state.block.checked_shl(shift).unwrap_or(u64::MAX);
            inner.block = inner.block.max(wanted);
        } else {
            let shift = inner.bits - state.bits;
            let wanted = (state.block >> shift) + 1;
            inner.block = inner.block.max(wanted);
        }
    }

    /// Base id of a fresh range `2^width` wide (at least one block).
    pub fn next(&self, width: u32) -> Result<u64> {
        let mut inner = self.inner.lock();
        let bits = inner.bits;
        let block = inner.block;
        let exhausted = || ActiveError::AllocatorExhausted { bits, block };
        if width <= bits {
            let base = shl_checked(block, bits).ok_or_else(exhausted)?;
            inner.block = block.checked_add(1).ok_or_else(exhausted)?;
            return Ok(base);
        }
        let shift = width - bits;
        if shift >= 64 {
            return Err(exhausted());
        }
        let span = 1u64 << shift;
        let aligned = block
            .checked_add(span - 1)
            .map(|b| (b >> shift) << shift)
            .ok_or_else(exhausted)?;
        let base = shl_checked(aligned, bits).ok_or_else(exhausted)?;
        inner.block = aligned.checked_add(span).ok_or_else(exhausted)?;
        Ok(base)
    }
}

fn shl_checked(block: u64, bits: u32) -> Option<u64> {
    if bits >= 64 {
        return if block == 0 { Some(0) } else { None };
    }
    if block >> (64 - bits) != 0 {
        return None;
    }
    // the computed-variable flag bit is reserved
    let base = block << bits;
    if base & (1 << 63) != 0 {
        return None;
    }
    Some(base)
}

/// Sequential ids handed out from blocks of the shared allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VarBlock {
    /// Next id to hand out; 0 means no block held.
    pub next: u64,
}

impl VarBlock {
    /// Reserve `n` consecutive ids in one block, taking a new block when the
    /// current one cannot fit them.
    pub fn reserve(&mut self, system: &ActiveSystem, n: usize) -> Result<u64> {
        let bits = system.bits();
        let capacity = 1u64 << bits;
        if n as u64 > capacity {
            return Err(ActiveError::BlockOverflow { needed: n, capacity });
        }
        let used = if self.next == 0 { capacity } else { offset_of(self.next, bits) };
        if self.next == 0 || used == 0 || capacity - used < n as u64 {
            self.next = system.next(bits)?;
        }
        let first = self.next;
        self.next += n as u64;
        Ok(first)
    }

    pub fn take(&mut self, system: &ActiveSystem) -> Result<u64> {
        self.reserve(system, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_blocks_are_sequential() {
        let sys = ActiveSystem::new(16);
        assert_eq!(sys.next(16).unwrap(), 1 << 16);
        assert_eq!(sys.next(8).unwrap(), 2 << 16);
        assert_eq!(sys.state().block, 3);
    }

    #[test]
    fn test_wide_request_aligns() {
        let sys = ActiveSystem::new(16);
        assert_eq!(sys.next(16).unwrap(), 1 << 16);
        // 2 blocks wide: aligned to an even block
        assert_eq!(sys.next(17).unwrap(), 2 << 16);
        assert_eq!(sys.state().block, 4);
        assert_eq!(sys.next(18).unwrap(), 4 << 16);
        assert_eq!(sys.state().block, 8);
    }

    #[test]
    fn test_exhaustion_is_error() {
        let sys = ActiveSystem::new(63);
        assert!(sys.next(63).is_err());
    }

    #[test]
    fn test_bits_clamped() {
        let sys = ActiveSystem::new(64);
        assert_eq!(sys.bits(), BITS_MAX);
        let mut vb = VarBlock::default();
        assert_eq!(vb.take(&sys).unwrap(), 1 << BITS_MAX);
        assert_eq!(ActiveSystem::new(0).bits(), 1);
    }

    #[test]
    fn test_concurrent_ranges_disjoint() {
        let sys = Arc::new(ActiveSystem::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = sys.clone();
                thread::spawn(move || (0..100).map(|_| s.next(8).unwrap()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for base in h.join().unwrap() {
                assert!(seen.insert(base));
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[test]
    fn test_restore_never_rewinds() {
        let sys = ActiveSystem::new(16);
        sys.next(16).unwrap();
        sys.next(16).unwrap();
        sys.restore(SystemState { bits: 16, block: 2 });
        assert_eq!(sys.state().block, 3);
        sys.restore(SystemState { bits: 16, block: 10 });
        assert_eq!(sys.state().block, 10);
    }

    #[test]
    fn test_var_block_reserve() {
        let sys = ActiveSystem::new(4);
        let mut vb = VarBlock::default();
        let a = vb.take(&sys).unwrap();
        assert_eq!(a, 1 << 4);
        let b = vb.reserve(&sys, 3).unwrap();
        assert_eq!(b, a + 1);
        // 12 left in the block, 13 do not fit
        let c = vb.reserve(&sys, 13).unwrap();
        assert_eq!(c, 2 << 4);
        assert!(vb.reserve(&sys, 17).is_err());
    }
}
