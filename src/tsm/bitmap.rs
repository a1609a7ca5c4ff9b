//! Invoke ID allocation state for one peer.

use std::fmt;

use bitvec::prelude::*;

/// 8-bit identifier correlating a confirmed request with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvokeId(pub u8);

impl From<u8> for InvokeId {
    fn from(id: u8) -> Self {
        InvokeId(id)
    }
}

impl From<InvokeId> for u8 {
    fn from(id: InvokeId) -> Self {
        id.0
    }
}

impl fmt::Display for InvokeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 256-bit set of invoke IDs in use.
#[derive(Clone, Copy, Default)]
pub struct InvokeIdBitmap {
    bits: BitArr!(for 256, in u64, Lsb0),
}

impl InvokeIdBitmap {
    pub const CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: InvokeId) -> bool {
        self.bits[id.0 as usize]
    }

    /// Marks `id` used; returns false if it already was.
    pub fn insert(&mut self, id: InvokeId) -> bool {
        !self.bits.replace(id.0 as usize, true)
    }

    /// Releases `id`; returns false if it was not in use.
    pub fn remove(&mut self, id: InvokeId) -> bool {
        self.bits.replace(id.0 as usize, false)
    }

    pub fn used(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn free(&self) -> usize {
        Self::CAPACITY - self.used()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    /// First free ID at or after `from`, wrapping around once.
    pub fn next_free(&self, from: InvokeId) -> Option<InvokeId> {
        let from = from.0 as usize;
        self.bits[from..]
            .first_zero()
            .map(|offset| from + offset)
            .or_else(|| self.bits[..from].first_zero())
            .map(|index| InvokeId(index as u8))
    }
}

impl PartialEq for InvokeIdBitmap {
    fn eq(&self, other: &Self) -> bool {
        self.bits.as_bitslice() == other.bits.as_bitslice()
    }
}

impl Eq for InvokeIdBitmap {}

impl fmt::Debug for InvokeIdBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = self.bits.as_raw_slice();
        write!(
            f,
            "InvokeIdBitmap({:016x}{:016x}{:016x}{:016x}, used {})",
            words[3],
            words[2],
            words[1],
            words[0],
            self.used()
        )
    }
}
