use serde::{Deserialize, Serialize};
use std::fmt;

/// A guest program counter.
///
/// We define a distinct value type (rather than passing `u64`s around) so
/// that guest code addresses cannot be silently mixed with host addresses or
/// plain data addresses. All arithmetic is explicit and wrapping, matching
/// how the guest ISA wraps its instruction pointer.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GuestPc(u64);

impl GuestPc {
    pub fn new(pc: u64) -> GuestPc {
        GuestPc(pc)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Byte offset from this PC, e.g. to address into an instruction's bytes.
    pub fn offset(self, delta: u64) -> GuestPc {
        GuestPc(self.0.wrapping_add(delta))
    }

    /// Truncate to an address space's pointer width.
    pub fn masked(self, addr_mask: u64) -> GuestPc {
        GuestPc(self.0 & addr_mask)
    }
}

impl From<u64> for GuestPc {
    fn from(pc: u64) -> GuestPc {
        GuestPc(pc)
    }
}

impl fmt::Display for GuestPc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for GuestPc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
