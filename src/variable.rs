//! Variable identifiers.
//!
//! A raw id is a `u64` split into a high block field and a low offset field,
//! `bits` wide. A computed id names a value prefix of a dense parent
//! variable: it is 1 for rows whose parent value, truncated to its top
//! `bit_width` bits, equals `value`. Prefixes of width `w` are ancestors of
//! the prefixes of width `w + 1` they contain, so computed ids form a value
//! hierarchy without an explicit tree.

use crate::error::{ActiveError, Result};

const COMPUTED_FLAG: u64 = 1 << 63;
const VALUE_BITS: u32 = 8;
const WIDTH_BITS: u32 = 4;
const PARENT_SHIFT: u32 = VALUE_BITS + WIDTH_BITS;
/// Largest parent id a computed variable can carry.
pub const PARENT_MAX: u64 = (1 << (63 - PARENT_SHIFT)) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variable {
    Raw(u64),
    Computed { parent: u64, bit_width: u8, value: u8 },
}

impl Variable {
    pub fn encode(&self) -> Result<u64> {
        match *self {
            Variable::Raw(id) => {
                if id & COMPUTED_FLAG != 0 {
                    return Err(ActiveError::Format(format!("raw id {:#x} uses the computed flag", id)));
                }
                Ok(id)
            }
            Variable::Computed { parent, bit_width, value } => {
                if parent > PARENT_MAX {
                    return Err(ActiveError::Format(format!("computed parent {} too large", parent)));
                }
                if bit_width == 0 || bit_width > 8 {
                    return Err(ActiveError::Format(format!("computed bit width {} out of range", bit_width)));
                }
                if bit_width < 8 && (value >> bit_width) != 0 {
                    return Err(ActiveError::Format(format!(
                        "computed value {} wider than {} bits",
                        value, bit_width
                    )));
                }
                Ok(COMPUTED_FLAG
                    | (parent << PARENT_SHIFT)
                    | ((bit_width as u64) << VALUE_BITS)
                    | value as u64)
            }
        }
    }

    pub fn decode(id: u64) -> Self {
        if id & COMPUTED_FLAG == 0 {
            return Variable::Raw(id);
        }
        let body = id & !COMPUTED_FLAG;
        Variable::Computed {
            parent: body >> PARENT_SHIFT,
            bit_width: ((body >> VALUE_BITS) & ((1 << WIDTH_BITS) - 1)) as u8,
            value: (body & 0xff) as u8,
        }
    }

    /// The next coarser prefix, if any.
    pub fn ancestor(&self) -> Option<Variable> {
        match *self {
            Variable::Computed { parent, bit_width, value } if bit_width > 1 => Some(Variable::Computed {
                parent,
                bit_width: bit_width - 1,
                value: value >> 1,
            }),
            _ => None,
        }
    }
}

pub fn is_computed(id: u64) -> bool {
    id & COMPUTED_FLAG != 0
}

pub fn block_of(id: u64, bits: u32) -> u64 {
    id >> bits
}

pub fn offset_of(id: u64, bits: u32) -> u64 {
    id & ((1u64 << bits) - 1)
}

/// Bits needed to hold values `0..valency`.
pub fn valency_bits(valency: u16) -> u8 {
    if valency <= 1 {
        return 0;
    }
    (16 - (valency - 1).leading_zeros()) as u8
}

/// Top `width` bits of `value` within a `vbits`-bit value range.
pub fn prefix(value: u8, vbits: u8, width: u8) -> u8 {
    if width >= vbits {
        value
    } else {
        value >> (vbits - width)
    }
}
