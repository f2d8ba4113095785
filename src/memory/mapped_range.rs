use crate::memory::{CodeVersion, PAGE_SIZE};
use crate::util;
use log::debug;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr;
use std::rc::Rc;

pub type MappedRangeSharedPtr = Rc<MappedRange>;

/// What holds the bytes of a range.
///
/// `Zeroed` is the anonymous-zero origin: no buffer exists until the first
/// write touches the range, and reads observe zeros. `Bytes` backings are
/// reference-counted so a forked address space shares them until either side
/// writes (`Rc::make_mut` duplicates on the first mutation through a shared
/// handle).
#[derive(Clone, Debug)]
enum Backing {
    /// Tombstone. Never readable, writable or executable.
    Invalid,
    /// Anonymous-zero, not yet materialised.
    Zeroed,
    Bytes(Rc<Vec<u8>>),
}

/// Backing store for one contiguous page-aligned region `[base, limit)` of a
/// guest address space.
pub struct MappedRange {
    base: u64,
    limit: u64,
    name: String,
    /// Offset into the origin file for file-backed ranges, zero otherwise.
    file_offset: u64,
    backing: RefCell<Backing>,
    /// Cached code version; `NONE` until computed or after a split copy.
    version: Cell<CodeVersion>,
}

impl MappedRange {
    /// Anonymous range backed by a zero-filled buffer.
    pub fn anon(base: u64, limit: u64, name: &str) -> MappedRange {
        MappedRange::with_bytes(base, limit, name, 0, vec![0u8; (limit - base) as usize])
    }

    /// Anonymous-zero range; the buffer is materialised on first write.
    pub fn anon_zero(base: u64, limit: u64, name: &str) -> MappedRange {
        debug_assert!(util::is_page_aligned(base) && util::is_page_aligned(limit));
        MappedRange {
            base,
            limit,
            name: name.to_owned(),
            file_offset: 0,
            backing: RefCell::new(Backing::Zeroed),
            version: Cell::new(CodeVersion::NONE),
        }
    }

    /// Range whose initial content was loaded from a snapshot page file.
    pub fn with_bytes(
        base: u64,
        limit: u64,
        name: &str,
        file_offset: u64,
        bytes: Vec<u8>,
    ) -> MappedRange {
        debug_assert!(util::is_page_aligned(base) && util::is_page_aligned(limit));
        debug_assert_eq!(bytes.len() as u64, limit - base);
        MappedRange {
            base,
            limit,
            name: name.to_owned(),
            file_offset,
            backing: RefCell::new(Backing::Bytes(Rc::new(bytes))),
            version: Cell::new(CodeVersion::NONE),
        }
    }

    /// The tombstone covering everything no valid range claims. Range lookup
    /// is total because of this sentinel.
    pub fn invalid() -> MappedRange {
        MappedRange {
            base: 0,
            limit: u64::max_value(),
            name: String::new(),
            file_offset: 0,
            backing: RefCell::new(Backing::Invalid),
            version: Cell::new(CodeVersion::NONE),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn size(&self) -> u64 {
        self.limit - self.base
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn is_valid(&self) -> bool {
        match *self.backing.borrow() {
            Backing::Invalid => false,
            _ => true,
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr < self.limit
    }

    pub fn read(&self, addr: u64) -> Option<u8> {
        if !self.contains(addr) {
            return None;
        }
        match &*self.backing.borrow() {
            Backing::Invalid => None,
            Backing::Zeroed => Some(0),
            Backing::Bytes(bytes) => Some(bytes[(addr - self.base) as usize]),
        }
    }

    pub fn write(&self, addr: u64, byte: u8) -> bool {
        if !self.contains(addr) {
            return false;
        }
        let index = (addr - self.base) as usize;
        let mut backing = self.backing.borrow_mut();
        match &mut *backing {
            Backing::Invalid => false,
            Backing::Zeroed => {
                let mut bytes = vec![0u8; self.size() as usize];
                bytes[index] = byte;
                *backing = Backing::Bytes(Rc::new(bytes));
                true
            }
            Backing::Bytes(bytes) => {
                Rc::make_mut(bytes)[index] = byte;
                true
            }
        }
    }

    /// Pointer into the host buffer for read fast paths. Null when no buffer
    /// can be produced at `addr` (tombstones, unmaterialised zero ranges).
    /// The pointer is valid until the next map mutation of the owning space.
    pub fn to_read_only_ptr(&self, addr: u64) -> *const u8 {
        if !self.contains(addr) {
            return ptr::null();
        }
        match &*self.backing.borrow() {
            Backing::Bytes(bytes) => unsafe { bytes.as_ptr().add((addr - self.base) as usize) },
            _ => ptr::null(),
        }
    }

    /// Pointer for write fast paths. Materialises zero ranges and unshares a
    /// copy-on-write backing first, since stores through the pointer bypass
    /// `write()`.
    pub fn to_read_write_ptr(&self, addr: u64) -> *mut u8 {
        if !self.contains(addr) {
            return ptr::null_mut();
        }
        let mut backing = self.backing.borrow_mut();
        if let Backing::Zeroed = *backing {
            *backing = Backing::Bytes(Rc::new(vec![0u8; self.size() as usize]));
        }
        match &mut *backing {
            Backing::Bytes(bytes) => unsafe {
                Rc::make_mut(bytes)
                    .as_mut_ptr()
                    .add((addr - self.base) as usize)
            },
            _ => ptr::null_mut(),
        }
    }

    /// Clone for a forked address space: the backing is shared until either
    /// side writes, and the clone gets its own version cell (initially equal,
    /// because the contents are equal).
    pub fn clone_range(&self) -> MappedRange {
        MappedRange {
            base: self.base,
            limit: self.limit,
            name: self.name.clone(),
            file_offset: self.file_offset,
            backing: RefCell::new(self.backing.borrow().clone()),
            version: Cell::new(self.version.get()),
        }
    }

    /// Sub-range `[new_base, new_limit)` of this range, used when an
    /// overlapping map insertion splits an existing one. The copy gets a
    /// private buffer and an uncomputed version.
    pub fn copy(&self, new_base: u64, new_limit: u64) -> MappedRange {
        debug_assert!(self.base <= new_base && new_limit <= self.limit);
        debug_assert!(new_base < new_limit);
        let backing = match &*self.backing.borrow() {
            Backing::Invalid => Backing::Invalid,
            Backing::Zeroed => Backing::Zeroed,
            Backing::Bytes(bytes) => {
                let from = (new_base - self.base) as usize;
                let to = (new_limit - self.base) as usize;
                Backing::Bytes(Rc::new(bytes[from..to].to_vec()))
            }
        };
        MappedRange {
            base: new_base,
            limit: new_limit,
            name: self.name.clone(),
            file_offset: self.file_offset + (new_base - self.base),
            backing: RefCell::new(backing),
            version: Cell::new(CodeVersion::NONE),
        }
    }

    /// Digest of this range's bytes, cached. Two ranges with identical bytes
    /// report identical versions until one of them is invalidated.
    pub fn compute_code_version(&self) -> CodeVersion {
        let cached = self.version.get();
        if !cached.is_none() {
            return cached;
        }
        let version = match &*self.backing.borrow() {
            Backing::Invalid => return CodeVersion::NONE,
            Backing::Zeroed => {
                // Digest the logical zeros without materialising the range.
                let zeros = [0u8; PAGE_SIZE as usize];
                let mut digest = util::Digest::with_seed(0);
                let mut left = self.size();
                while left > 0 {
                    let chunk = left.min(PAGE_SIZE) as usize;
                    digest.update(&zeros[..chunk]);
                    left -= chunk as u64;
                }
                CodeVersion::from_digest(digest.finish())
            }
            Backing::Bytes(bytes) => CodeVersion::from_digest(util::digest64(0, bytes)),
        };
        self.version.set(version);
        version
    }

    /// Assign a fresh token. Called when a write lands on executable bytes;
    /// every dispatch key derived from this range changes from here on.
    pub fn invalidate_code_version(&self) {
        let token = CodeVersion::fresh();
        debug!(
            "invalidating code version of [{:#x}, {:#x}) -> {}",
            self.base, self.limit, token
        );
        self.version.set(token);
    }
}

impl fmt::Debug for MappedRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match &*self.backing.borrow() {
            Backing::Invalid => "invalid",
            Backing::Zeroed => "zero",
            Backing::Bytes(_) => "bytes",
        };
        write!(
            f,
            "MappedRange([{:#x}, {:#x}) {} {:?})",
            self.base, self.limit, kind, self.name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_respects_bounds() {
        let range = MappedRange::anon(0x1000, 0x2000, "r");
        assert_eq!(range.read(0x1000), Some(0));
        assert!(range.write(0x1fff, 0xAA));
        assert_eq!(range.read(0x1fff), Some(0xAA));
        assert_eq!(range.read(0x2000), None);
        assert!(!range.write(0xfff, 1));
    }

    #[test]
    fn tombstone_rejects_everything() {
        let range = MappedRange::invalid();
        assert!(range.contains(0x1234));
        assert_eq!(range.read(0x1234), None);
        assert!(!range.write(0x1234, 1));
        assert!(range.to_read_only_ptr(0x1234).is_null());
    }

    #[test]
    fn zero_range_materialises_on_write() {
        let range = MappedRange::anon_zero(0x1000, 0x2000, "z");
        assert!(range.to_read_only_ptr(0x1000).is_null());
        assert_eq!(range.read(0x1800), Some(0));
        assert!(range.write(0x1800, 7));
        assert_eq!(range.read(0x1800), Some(7));
        assert!(!range.to_read_only_ptr(0x1000).is_null());
    }

    #[test]
    fn clone_is_copy_on_write() {
        let parent = MappedRange::anon(0x1000, 0x2000, "p");
        assert!(parent.write(0x1100, 1));
        let child = parent.clone_range();
        assert_eq!(child.read(0x1100), Some(1));
        assert!(child.write(0x1100, 2));
        assert_eq!(child.read(0x1100), Some(2));
        assert_eq!(parent.read(0x1100), Some(1));
    }

    #[test]
    fn copy_takes_sub_range_content() {
        let range = MappedRange::anon(0x1000, 0x3000, "c");
        assert!(range.write(0x2004, 0x5A));
        let upper = range.copy(0x2000, 0x3000);
        assert_eq!(upper.base(), 0x2000);
        assert_eq!(upper.read(0x2004), Some(0x5A));
        assert_eq!(upper.read(0x1fff), None);
    }

    #[test]
    fn version_digest_matches_for_identical_content() {
        let a = MappedRange::anon(0x1000, 0x2000, "a");
        let b = MappedRange::anon(0x4000, 0x5000, "b");
        assert_eq!(a.compute_code_version(), b.compute_code_version());
    }

    #[test]
    fn zero_and_materialised_zero_agree() {
        let lazy = MappedRange::anon_zero(0x1000, 0x3000, "z");
        let eager = MappedRange::anon(0x1000, 0x3000, "e");
        assert_eq!(lazy.compute_code_version(), eager.compute_code_version());
    }

    #[test]
    fn invalidation_yields_fresh_tokens() {
        let range = MappedRange::anon(0x1000, 0x2000, "v");
        let before = range.compute_code_version();
        range.invalidate_code_version();
        let after = range.compute_code_version();
        assert_ne!(before, after);
        range.invalidate_code_version();
        assert_ne!(range.compute_code_version(), after);
    }

    #[test]
    fn clone_starts_with_equal_version() {
        let parent = MappedRange::anon(0x1000, 0x2000, "p");
        let parent_version = parent.compute_code_version();
        let child = parent.clone_range();
        assert_eq!(child.compute_code_version(), parent_version);
        child.invalidate_code_version();
        assert_ne!(child.compute_code_version(), parent.compute_code_version());
    }
}
