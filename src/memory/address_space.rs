use crate::arch::ArchName;
use crate::flags::Flags;
use crate::guest_ptr::GuestPc;
use crate::memory::mapped_range::{MappedRange, MappedRangeSharedPtr};
use crate::memory::{CodeVersion, PagePerms, PAGE_SHIFT, PAGE_SIZE};
use crate::util;
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::ptr;
use std::rc::Rc;

pub type AddressSpaceSharedPtr = Rc<RefCell<AddressSpace>>;

/// Entries in the direct-mapped range caches, keyed by bits 12..17 of the
/// page address. Small enough to stay hot, big enough to cover the working
/// set of a trace.
const CACHE_SLOTS: usize = 64;

type RangeCache = [Option<(u64, MappedRangeSharedPtr)>; CACHE_SLOTS];

fn empty_cache() -> RangeCache {
    array_init::array_init(|_| None)
}

fn cache_slot(page: u64) -> usize {
    ((page >> PAGE_SHIFT) as usize) & (CACHE_SLOTS - 1)
}

/// One guest process's virtual memory: a sorted, disjoint set of valid
/// mapped ranges plus a tombstone sentinel that makes range lookup total.
///
/// Pages carry requested permissions in three sets; a page is effectively
/// readable/writable/executable only if it is in the corresponding set *and*
/// mapped by a valid range. A second page index covering only
/// writable-and-not-executable pages lets the store fast path skip the
/// self-modifying-code bookkeeping entirely.
pub struct AddressSpace {
    /// Valid ranges, sorted by base, pairwise disjoint.
    maps: Vec<MappedRangeSharedPtr>,
    /// Sentinel returned for any address no valid range claims.
    invalid_map: MappedRangeSharedPtr,

    readable_pages: HashSet<u64>,
    writable_pages: HashSet<u64>,
    executable_pages: HashSet<u64>,

    page_to_map: HashMap<u64, MappedRangeSharedPtr>,
    wnx_page_to_map: HashMap<u64, MappedRangeSharedPtr>,
    page_cache: RefCell<RangeCache>,
    wnx_cache: RefCell<RangeCache>,

    /// PCs already handed to the trace decoder; cleared wholesale when a
    /// store hits executable bytes.
    trace_heads: RefCell<HashSet<u64>>,

    addr_mask: u64,
    track_code_versions: bool,
    dead: bool,
    arch: ArchName,
}

impl AddressSpace {
    pub fn new(arch: ArchName) -> AddressSpace {
        AddressSpace {
            maps: Vec::new(),
            invalid_map: Rc::new(MappedRange::invalid()),
            readable_pages: HashSet::new(),
            writable_pages: HashSet::new(),
            executable_pages: HashSet::new(),
            page_to_map: HashMap::new(),
            wnx_page_to_map: HashMap::new(),
            page_cache: RefCell::new(empty_cache()),
            wnx_cache: RefCell::new(empty_cache()),
            trace_heads: RefCell::new(HashSet::new()),
            addr_mask: arch.address_mask(),
            track_code_versions: Flags::get().version_code,
            dead: false,
            arch,
        }
    }

    pub fn into_shared(self) -> AddressSpaceSharedPtr {
        Rc::new(RefCell::new(self))
    }

    pub fn arch(&self) -> ArchName {
        self.arch
    }

    pub fn addr_mask(&self) -> u64 {
        self.addr_mask
    }

    pub fn set_track_code_versions(&mut self, on: bool) {
        self.track_code_versions = on;
    }

    /// Copy-on-write clone for a guest fork. Ranges share their backing
    /// buffers until either side writes; permission sets and the trace-head
    /// memo are duplicated.
    pub fn fork(&self) -> AddressSpace {
        let mut child = AddressSpace {
            maps: self.maps.iter().map(|m| Rc::new(m.clone_range())).collect(),
            invalid_map: Rc::new(MappedRange::invalid()),
            readable_pages: self.readable_pages.clone(),
            writable_pages: self.writable_pages.clone(),
            executable_pages: self.executable_pages.clone(),
            page_to_map: HashMap::new(),
            wnx_page_to_map: HashMap::new(),
            page_cache: RefCell::new(empty_cache()),
            wnx_cache: RefCell::new(empty_cache()),
            trace_heads: RefCell::new(self.trace_heads.borrow().clone()),
            addr_mask: self.addr_mask,
            track_code_versions: self.track_code_versions,
            dead: false,
            arch: self.arch,
        };
        child.rebuild();
        child
    }

    /// A dead address space stays observable but refuses all maps and I/O.
    pub fn kill(&mut self) {
        debug!("killing address space");
        self.dead = true;
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Insert an anonymous map with a zero-filled buffer. Overlapped parts of
    /// existing maps are dropped or split. Pages start readable and writable,
    /// not executable; callers adjust with `set_permissions`.
    pub fn add_map(&mut self, base: u64, size: u64, name: &str, offset: u64) {
        let (base, limit) = match self.map_span(base, size) {
            Some(span) => span,
            None => return,
        };
        let bytes = vec![0u8; (limit - base) as usize];
        self.install_map(MappedRange::with_bytes(base, limit, name, offset, bytes));
    }

    /// Insert an anonymous-zero map (no buffer until first write).
    pub fn add_map_zero(&mut self, base: u64, size: u64, name: &str) {
        let (base, limit) = match self.map_span(base, size) {
            Some(span) => span,
            None => return,
        };
        self.install_map(MappedRange::anon_zero(base, limit, name));
    }

    /// Insert a map whose initial content is `bytes` (e.g. loaded from a
    /// snapshot page file).
    pub fn add_map_bytes(&mut self, base: u64, size: u64, name: &str, offset: u64, bytes: Vec<u8>) {
        let (base, limit) = match self.map_span(base, size) {
            Some(span) => span,
            None => return,
        };
        debug_assert_eq!(bytes.len() as u64, limit - base);
        self.install_map(MappedRange::with_bytes(base, limit, name, offset, bytes));
    }

    /// Drop the maps covering `[base, base+size)`, splitting partial
    /// overlaps. The region reverts to the tombstone.
    pub fn remove_map(&mut self, base: u64, size: u64) {
        let (base, limit) = match self.map_span(base, size) {
            Some(span) => span,
            None => return,
        };
        debug!("removing maps in [{:#x}, {:#x})", base, limit);
        let mut kept: Vec<MappedRangeSharedPtr> = Vec::with_capacity(self.maps.len());
        for m in &self.maps {
            if m.limit() <= base || m.base() >= limit {
                kept.push(m.clone());
                continue;
            }
            if m.base() < base {
                kept.push(Rc::new(m.copy(m.base(), base)));
            }
            if m.limit() > limit {
                kept.push(Rc::new(m.copy(limit, m.limit())));
            }
        }
        self.maps = kept;
        self.set_page_perms(base, limit, PagePerms::empty());
        self.trace_heads.borrow_mut().clear();
        self.rebuild();
    }

    /// Page-granularity permission update over `[base, base+size)`.
    pub fn set_permissions(&mut self, base: u64, size: u64, perms: PagePerms) {
        if self.dead {
            return;
        }
        let (base, limit) = match self.map_span(base, size) {
            Some(span) => span,
            None => return,
        };
        self.set_page_perms(base, limit, perms);
        self.rebuild();
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        let page = util::page_base(addr & self.addr_mask);
        self.page_to_map.contains_key(&page)
    }

    pub fn can_read(&self, addr: u64) -> bool {
        !self.dead && self.page_in(addr, &self.readable_pages)
    }

    pub fn can_write(&self, addr: u64) -> bool {
        !self.dead && self.page_in(addr, &self.writable_pages)
    }

    pub fn can_execute(&self, addr: u64) -> bool {
        !self.dead && self.page_in(addr, &self.executable_pages)
    }

    /// Cross-range, permission-checked byte read.
    pub fn try_read_bytes(&self, addr: u64, out: &mut [u8]) -> bool {
        for (i, slot) in out.iter_mut().enumerate() {
            let a = addr.wrapping_add(i as u64) & self.addr_mask;
            if !self.can_read(a) {
                return false;
            }
            match self.find_range(a).read(a) {
                Some(byte) => *slot = byte,
                None => return false,
            }
        }
        true
    }

    /// Cross-range, permission-checked byte write. All-or-nothing: the
    /// permission check for every byte happens before the first store. A
    /// store landing on an executable page invalidates that range's code
    /// version and clears the trace-head memo.
    pub fn try_write_bytes(&mut self, addr: u64, bytes: &[u8]) -> bool {
        for i in 0..bytes.len() {
            let a = addr.wrapping_add(i as u64) & self.addr_mask;
            if !self.can_write(a) {
                return false;
            }
        }
        let mut heads_cleared = false;
        for (i, byte) in bytes.iter().enumerate() {
            let a = addr.wrapping_add(i as u64) & self.addr_mask;
            let range = self.find_range(a);
            if self.page_in(a, &self.executable_pages) {
                range.invalidate_code_version();
                if !heads_cleared {
                    debug!("write to executable page {:#x}; dropping trace heads", a);
                    self.trace_heads.borrow_mut().clear();
                    heads_cleared = true;
                }
            }
            if !range.write(a, *byte) {
                return false;
            }
        }
        true
    }

    /// Typed scalar read. Takes the direct-pointer path when the whole value
    /// sits inside one readable page of one materialised range.
    pub fn try_read_val<T: Scalar>(&self, addr: u64) -> Option<T> {
        let a = addr & self.addr_mask;
        let size = mem::size_of::<T>() as u64;
        let last = a.wrapping_add(size - 1);
        if util::page_base(a) == util::page_base(last) && self.can_read(a) {
            let p = self.find_range(a).to_read_only_ptr(a);
            if !p.is_null() {
                return Some(unsafe { ptr::read_unaligned(p as *const T) });
            }
        }
        let mut buf = [0u8; 8];
        if self.try_read_bytes(addr, &mut buf[..size as usize]) {
            Some(T::from_le_bytes(&buf[..size as usize]))
        } else {
            None
        }
    }

    /// Typed scalar write. The fast path goes through the
    /// writable-non-executable index, so it never needs the SMC checks; any
    /// store that might touch executable bytes falls back to the byte path.
    pub fn try_write_val<T: Scalar>(&mut self, addr: u64, val: T) -> bool {
        let a = addr & self.addr_mask;
        let size = mem::size_of::<T>() as u64;
        let last = a.wrapping_add(size - 1);
        if util::page_base(a) == util::page_base(last) && !self.dead {
            if let Some(range) = self.find_wnx_range(a) {
                let p = range.to_read_write_ptr(a);
                if !p.is_null() {
                    unsafe { ptr::write_unaligned(p as *mut T, val) };
                    return true;
                }
            }
        }
        let mut buf = [0u8; 8];
        val.to_le_bytes(&mut buf[..size as usize]);
        self.try_write_bytes(addr, &buf[..size as usize])
    }

    /// Byte read that additionally requires execute permission; the decoder's
    /// only window into guest memory.
    pub fn try_read_executable(&self, pc: GuestPc, out: &mut u8) -> bool {
        let a = pc.as_u64() & self.addr_mask;
        if !self.can_execute(a) {
            return false;
        }
        match self.find_range(a).read(a) {
            Some(byte) => {
                *out = byte;
                true
            }
            None => false,
        }
    }

    /// Highest page-aligned address in `[min, max)` where `size` bytes fit
    /// without touching any valid range.
    pub fn find_hole(&self, min: u64, max: u64, size: u64) -> Option<u64> {
        if size == 0 || max <= min {
            return None;
        }
        let mut upper = u64::max_value();
        for m in self.maps.iter().rev() {
            if let Some(addr) = place_in_gap(m.limit(), upper, min, max, size) {
                return Some(addr);
            }
            upper = m.base();
        }
        place_in_gap(0, upper, min, max, size)
    }

    pub fn mark_trace_head(&self, pc: GuestPc) {
        self.trace_heads
            .borrow_mut()
            .insert(pc.as_u64() & self.addr_mask);
    }

    pub fn is_trace_head(&self, pc: GuestPc) -> bool {
        self.trace_heads
            .borrow()
            .contains(&(pc.as_u64() & self.addr_mask))
    }

    /// Version of the code containing `pc`; `NONE` when versioning is off or
    /// `pc` is unmapped.
    pub fn compute_code_version(&self, pc: GuestPc) -> CodeVersion {
        if !self.track_code_versions {
            return CodeVersion::NONE;
        }
        let a = pc.as_u64() & self.addr_mask;
        let range = self.find_range(a);
        if !range.is_valid() {
            return CodeVersion::NONE;
        }
        range.compute_code_version()
    }

    /// Log every range with its first page's effective permissions.
    pub fn dump_maps(&self) {
        for m in &self.maps {
            let page = m.base();
            debug!(
                "  [{:#016x}, {:#016x}) {}{}{} {}",
                m.base(),
                m.limit(),
                if self.readable_pages.contains(&page) { "r" } else { "-" },
                if self.writable_pages.contains(&page) { "w" } else { "-" },
                if self.executable_pages.contains(&page) { "x" } else { "-" },
                m.name(),
            );
        }
    }

    fn page_in(&self, addr: u64, set: &HashSet<u64>) -> bool {
        let page = util::page_base(addr & self.addr_mask);
        set.contains(&page) && self.page_to_map.contains_key(&page)
    }

    /// Total range lookup through the direct-mapped cache; misses fall back
    /// to the page index and then to the tombstone sentinel.
    fn find_range(&self, addr: u64) -> MappedRangeSharedPtr {
        let page = util::page_base(addr & self.addr_mask);
        let slot = cache_slot(page);
        {
            let cache = self.page_cache.borrow();
            if let Some((cached_page, range)) = &cache[slot] {
                if *cached_page == page {
                    return range.clone();
                }
            }
        }
        match self.page_to_map.get(&page) {
            Some(range) => {
                self.page_cache.borrow_mut()[slot] = Some((page, range.clone()));
                range.clone()
            }
            None => self.invalid_map.clone(),
        }
    }

    /// Lookup restricted to writable-and-not-executable pages. `None` forces
    /// callers onto the slow path that performs the SMC bookkeeping.
    fn find_wnx_range(&self, addr: u64) -> Option<MappedRangeSharedPtr> {
        let page = util::page_base(addr & self.addr_mask);
        let slot = cache_slot(page);
        {
            let cache = self.wnx_cache.borrow();
            if let Some((cached_page, range)) = &cache[slot] {
                if *cached_page == page {
                    return Some(range.clone());
                }
            }
        }
        let range = self.wnx_page_to_map.get(&page)?.clone();
        self.wnx_cache.borrow_mut()[slot] = Some((page, range.clone()));
        Some(range)
    }

    fn map_span(&self, base: u64, size: u64) -> Option<(u64, u64)> {
        if self.dead {
            warn!("map operation on dead address space ignored");
            return None;
        }
        if size == 0 {
            return None;
        }
        let masked = base & self.addr_mask;
        let limit = util::page_align_up(masked.wrapping_add(size));
        Some((util::page_base(masked), limit))
    }

    fn install_map(&mut self, range: MappedRange) {
        let (base, limit) = (range.base(), range.limit());
        debug!("mapping [{:#x}, {:#x}) {:?}", base, limit, range.name());
        let mut kept: Vec<MappedRangeSharedPtr> = Vec::with_capacity(self.maps.len() + 1);
        for m in &self.maps {
            if m.limit() <= base || m.base() >= limit {
                kept.push(m.clone());
                continue;
            }
            // Partial overlaps keep the uncovered prefix and/or suffix of the
            // old map; fully covered maps are dropped.
            if m.base() < base {
                kept.push(Rc::new(m.copy(m.base(), base)));
            }
            if m.limit() > limit {
                kept.push(Rc::new(m.copy(limit, m.limit())));
            }
        }
        kept.push(Rc::new(range));
        self.maps = kept;
        self.set_page_perms(base, limit, PagePerms::rw());
        self.trace_heads.borrow_mut().clear();
        self.rebuild();
    }

    fn set_page_perms(&mut self, base: u64, limit: u64, perms: PagePerms) {
        let mut page = base;
        while page < limit {
            set_membership(&mut self.readable_pages, page, perms.contains(PagePerms::READ));
            set_membership(&mut self.writable_pages, page, perms.contains(PagePerms::WRITE));
            set_membership(&mut self.executable_pages, page, perms.contains(PagePerms::EXEC));
            page += PAGE_SIZE;
        }
    }

    /// Re-sort the maps and rebuild both page indices and caches. Invariant:
    /// runs after every map or permission mutation.
    fn rebuild(&mut self) {
        self.maps.sort_by_key(|m| m.base());
        self.page_to_map.clear();
        self.wnx_page_to_map.clear();
        for m in &self.maps {
            let mut page = m.base();
            while page < m.limit() {
                self.page_to_map.insert(page, m.clone());
                if self.writable_pages.contains(&page) && !self.executable_pages.contains(&page) {
                    self.wnx_page_to_map.insert(page, m.clone());
                }
                page += PAGE_SIZE;
            }
        }
        *self.page_cache.borrow_mut() = empty_cache();
        *self.wnx_cache.borrow_mut() = empty_cache();
    }
}

fn set_membership(set: &mut HashSet<u64>, page: u64, present: bool) {
    if present {
        set.insert(page);
    } else {
        set.remove(&page);
    }
}

fn place_in_gap(lo: u64, hi: u64, min: u64, max: u64, size: u64) -> Option<u64> {
    let top = hi.min(max);
    let bottom = lo.max(min);
    if top <= bottom || top - bottom < size {
        return None;
    }
    let addr = util::page_base(top - size);
    if addr >= bottom {
        Some(addr)
    } else {
        None
    }
}

/// Scalars eligible for the typed fast paths: 1/2/4/8-byte integers and the
/// 32/64-bit floats, all little-endian in guest memory.
pub trait Scalar: Copy {
    fn from_le_bytes(bytes: &[u8]) -> Self;
    fn to_le_bytes(self, out: &mut [u8]);
}

macro_rules! int_scalar {
    ($($t:ty),*) => {
        $(impl Scalar for $t {
            fn from_le_bytes(bytes: &[u8]) -> Self {
                let mut raw = [0u8; mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_le_bytes(raw)
            }

            fn to_le_bytes(self, out: &mut [u8]) {
                out.copy_from_slice(&<$t>::to_le_bytes(self));
            }
        })*
    };
}

int_scalar!(u8, u16, u32, u64, i8, i16, i32, i64);

impl Scalar for f32 {
    fn from_le_bytes(bytes: &[u8]) -> Self {
        f32::from_bits(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn to_le_bytes(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_bits().to_le_bytes());
    }
}

impl Scalar for f64 {
    fn from_le_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        f64::from_bits(u64::from_le_bytes(raw))
    }

    fn to_le_bytes(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_bits().to_le_bytes());
    }
}
