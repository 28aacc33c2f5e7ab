//! Executable memory arena
//!
//! Bump allocator over anonymous read/write/execute mappings. Compiled code
//! is copied into a fragment of a region and never moves afterwards. Each
//! region counts its live fragments and is unmapped when the last one is
//! released.
//!
//! Regions live in a slot vector and are referred to by index; the
//! availability list holds the indices of regions that still have room for
//! a useful fragment, most recently mapped first.

use std::sync::Arc;

use parking_lot::Mutex;

/// Fragments are padded to this size
const CODE_ALIGN: usize = 16;
/// A region left with less room than this stops serving allocations
pub const MIN_FRAGMENT: usize = 256;
/// Smallest region ever mapped
pub const MIN_BLOCK: usize = 64 * 1024;

/// Error while placing code in executable memory
#[derive(Debug, thiserror::Error)]
pub enum ExecMemoryError {
    #[error("Failed to map {size} bytes of executable memory: {source}")]
    MapFailed { size: usize, source: std::io::Error },
    #[error("Cannot place an empty code body")]
    Empty,
    #[error("Executable memory is not supported on this platform")]
    Unsupported,
}

/// A mapped region
struct Region {
    mapping: Mapping,
    used: usize,
    fragments: usize,
}

impl Region {
    fn remaining(&self) -> usize {
        self.mapping.size - self.used
    }
}

#[derive(Default)]
struct ArenaState {
    regions: Vec<Option<Region>>,
    free_slots: Vec<usize>,
    available: Vec<usize>,
}

/// Snapshot of the arena's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    /// Regions currently mapped
    pub regions: usize,
    /// Regions still serving allocations
    pub available: usize,
    /// Live fragments across all regions
    pub fragments: usize,
    /// Bytes mapped across all regions
    pub mapped_bytes: usize,
}

/// Process-wide pool of executable memory
#[derive(Default)]
pub struct ExecMemoryArena {
    state: Mutex<ArenaState>,
}

impl ExecMemoryArena {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy `code` into executable memory
    pub fn allocate(self: &Arc<Self>, code: &[u8]) -> Result<CodeAllocation, ExecMemoryError> {
        if code.is_empty() {
            return Err(ExecMemoryError::Empty);
        }
        let size = code.len().div_ceil(CODE_ALIGN) * CODE_ALIGN;

        let mut state = self.state.lock();
        let index = match state.first_fit(size) {
            Some(index) => index,
            None => state.map_region(size)?,
        };

        let region = state.regions[index].as_mut().ok_or(ExecMemoryError::Unsupported)?;
        let offset = region.used;
        // SAFETY: `offset + code.len()` lies within the mapping, and the range
        // past `used` belongs to no other fragment.
        let ptr = unsafe {
            let dest = region.mapping.base.add(offset);
            std::ptr::copy_nonoverlapping(code.as_ptr(), dest, code.len());
            dest
        };
        region.used += size;
        region.fragments += 1;
        let exhausted = region.remaining() < MIN_FRAGMENT;
        if exhausted {
            state.available.retain(|&i| i != index);
            log::trace!("exec region {} exhausted", index);
        }

        Ok(CodeAllocation {
            arena: Arc::clone(self),
            region: index,
            ptr,
            len: code.len(),
        })
    }

    /// Current bookkeeping counters
    pub fn stats(&self) -> ArenaStats {
        let state = self.state.lock();
        let live = state.regions.iter().flatten();
        ArenaStats {
            regions: live.clone().count(),
            available: state.available.len(),
            fragments: live.clone().map(|r| r.fragments).sum(),
            mapped_bytes: live.map(|r| r.mapping.size).sum(),
        }
    }

    fn release(&self, index: usize) {
        let mut state = self.state.lock();
        let Some(region) = state.regions[index].as_mut() else {
            debug_assert!(false, "release into unmapped region {}", index);
            return;
        };
        region.fragments -= 1;
        if region.fragments == 0 {
            state.regions[index] = None;
            state.available.retain(|&i| i != index);
            state.free_slots.push(index);
            log::trace!("exec region {} unmapped", index);
        }
    }
}

impl ArenaState {
    fn first_fit(&self, size: usize) -> Option<usize> {
        self.available.iter().copied().find(|&index| {
            self.regions[index].as_ref().is_some_and(|r| r.remaining() >= size)
        })
    }

    fn map_region(&mut self, size: usize) -> Result<usize, ExecMemoryError> {
        let mapping = Mapping::new(size.max(MIN_BLOCK))?;
        log::debug!("mapped exec region of {} bytes", mapping.size);
        let region = Region { mapping, used: 0, fragments: 0 };

        let index = match self.free_slots.pop() {
            Some(slot) => {
                self.regions[slot] = Some(region);
                slot
            }
            None => {
                self.regions.push(Some(region));
                self.regions.len() - 1
            }
        };
        self.available.insert(0, index);
        Ok(index)
    }
}

/// Compiled code placed in the arena; releases its fragment on drop
pub struct CodeAllocation {
    arena: Arc<ExecMemoryArena>,
    region: usize,
    ptr: *mut u8,
    len: usize,
}

// Safety: the fragment is written once in `allocate` and only read after.
unsafe impl Send for CodeAllocation {}
unsafe impl Sync for CodeAllocation {}

impl CodeAllocation {
    /// Address of the first code byte
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The code bytes as placed
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `ptr..ptr+len` was initialized in `allocate` and stays
        // mapped while this fragment is live.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for CodeAllocation {
    fn drop(&mut self) {
        self.arena.release(self.region);
    }
}

impl std::fmt::Debug for CodeAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeAllocation")
            .field("region", &self.region)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// An anonymous read/write/execute mapping
struct Mapping {
    base: *mut u8,
    size: usize,
}

// Safety: the arena lock serializes every write through `base`.
unsafe impl Send for Mapping {}

impl Mapping {
    #[cfg(unix)]
    fn new(min_size: usize) -> Result<Self, ExecMemoryError> {
        // SAFETY: sysconf has no preconditions.
        let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        };
        let size = min_size.div_ceil(page) * page;

        // SAFETY: anonymous private mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ExecMemoryError::MapFailed { size, source: std::io::Error::last_os_error() });
        }
        Ok(Mapping { base: ptr as *mut u8, size })
    }

    #[cfg(not(unix))]
    fn new(_min_size: usize) -> Result<Self, ExecMemoryError> {
        Err(ExecMemoryError::Unsupported)
    }
}

#[cfg(unix)]
impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_copies_code() {
        let arena = ExecMemoryArena::new();
        let alloc = arena.allocate(&[0xC3, 0x90, 0x90]).unwrap();
        assert_eq!(alloc.bytes(), &[0xC3, 0x90, 0x90]);
        assert_eq!(alloc.len(), 3);
        assert_eq!(alloc.as_ptr() as usize % CODE_ALIGN, 0);
    }

    #[test]
    fn test_small_allocations_share_a_region() {
        let arena = ExecMemoryArena::new();
        let a = arena.allocate(&[1; 100]).unwrap();
        let b = arena.allocate(&[2; 100]).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 112);

        let stats = arena.stats();
        assert_eq!(stats.regions, 1);
        assert_eq!(stats.fragments, 2);
        assert!(stats.mapped_bytes >= MIN_BLOCK);
    }

    #[test]
    fn test_large_allocation_maps_its_own_region() {
        let arena = ExecMemoryArena::new();
        let _small = arena.allocate(&[0; 64]).unwrap();
        let large = arena.allocate(&vec![7; MIN_BLOCK + 1]).unwrap();
        assert_eq!(large.bytes().len(), MIN_BLOCK + 1);
        assert_eq!(arena.stats().regions, 2);
    }

    #[test]
    fn test_exhausted_region_leaves_availability_list() {
        let arena = ExecMemoryArena::new();
        let first = arena.allocate(&vec![0; MIN_BLOCK - MIN_FRAGMENT + 16]).unwrap();
        let stats = arena.stats();
        assert_eq!(stats.regions, 1);
        assert_eq!(stats.available, 0);

        // Still mapped while the fragment lives
        assert_eq!(first.bytes()[0], 0);
        let _second = arena.allocate(&[1; 32]).unwrap();
        assert_eq!(arena.stats().regions, 2);
    }

    #[test]
    fn test_region_unmapped_with_last_fragment() {
        let arena = ExecMemoryArena::new();
        let a = arena.allocate(&[1; 32]).unwrap();
        let b = arena.allocate(&[2; 32]).unwrap();
        drop(a);
        assert_eq!(arena.stats().regions, 1);
        drop(b);
        assert_eq!(arena.stats(), ArenaStats::default());

        // The freed slot is reused
        let c = arena.allocate(&[3; 32]).unwrap();
        assert_eq!(c.region, 0);
    }

    #[test]
    fn test_empty_code_rejected() {
        let arena = ExecMemoryArena::new();
        assert!(matches!(arena.allocate(&[]), Err(ExecMemoryError::Empty)));
    }
}
