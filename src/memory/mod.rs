pub mod address_space;
pub mod mapped_range;

pub use address_space::{AddressSpace, AddressSpaceSharedPtr};
pub use mapped_range::{MappedRange, MappedRangeSharedPtr};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

bitflags! {
    /// Requested page protection. The effective protection of a page is the
    /// intersection of these bits with "the page is mapped by a valid range".
    pub struct PagePerms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl PagePerms {
    pub fn rw() -> PagePerms {
        PagePerms::READ | PagePerms::WRITE
    }

    pub fn rx() -> PagePerms {
        PagePerms::READ | PagePerms::EXEC
    }
}

/// Token identifying the byte content of an executable range. Part of the
/// dispatch key: a compiled trace is only reachable while the range it was
/// decoded from still carries the version it was decoded under.
///
/// The first computation for a range digests its bytes, so byte-identical
/// ranges (e.g. in forked address spaces) agree and share translations. A
/// write to executable bytes replaces the token with a fresh random one;
/// re-digesting would let a range that is rewritten back to old content
/// resurrect a stale version.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CodeVersion(u64);

impl CodeVersion {
    /// Versioning disabled, or the address is not in any valid range.
    pub const NONE: CodeVersion = CodeVersion(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Version derived from range content. Never collides with `NONE`.
    pub fn from_digest(digest: u64) -> CodeVersion {
        CodeVersion(if digest == 0 { 1 } else { digest })
    }

    /// A unique-for-this-process token, used when a range's executable bytes
    /// have been overwritten.
    pub fn fresh() -> CodeVersion {
        loop {
            let token: u64 = rand::random();
            if token != 0 {
                return CodeVersion(token);
            }
        }
    }
}

impl fmt::Display for CodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
