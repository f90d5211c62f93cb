//! Bump arena over a process-local heap block or a named shared-memory segment.
//!
//! Everything placed in an arena is addressed by [`Offset`], a byte offset from the start of the
//! segment. Offsets stay valid in every process that maps the segment, whatever address the
//! mapping lands at; a handle only turns an offset into a reference inside its own mapping.
#![allow(unsafe_code)]

use crate::foundation::error::{StreamError, StreamResult};
use memmap2::MmapMut;
use std::alloc::Layout;
use std::fs::OpenOptions;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const MAGIC: u64 = u64::from_le_bytes(*b"CUBESHM1");
const MAX_ROOTS: usize = 8;
const SEGMENT_ALIGN: usize = 64;

/// Types that may live inside arena memory.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no pointers or references, be valid when every byte
/// is zero, and only be mutated through interior mutability (atomics or `UnsafeCell`).
pub unsafe trait ArenaValue: Sized + Sync {}

/// Relocatable reference to a `T` stored in an [`Arena`].
#[repr(transparent)]
pub struct Offset<T> {
    raw: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Offset<T> {
    /// Offset zero is the segment header; no allocation ever lands there.
    pub const NULL: Offset<T> = Offset {
        raw: 0,
        _marker: PhantomData,
    };

    pub fn from_raw(raw: u64) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn raw(self) -> u64 {
        self.raw
    }

    pub fn is_null(self) -> bool {
        self.raw == 0
    }
}

impl<T> Clone for Offset<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Offset<T> {}

impl<T> PartialEq for Offset<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Offset<T> {}

impl<T> std::fmt::Debug for Offset<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Offset({:#x})", self.raw)
    }
}

#[repr(C)]
struct RootSlot {
    key: AtomicU64,
    offset: AtomicU64,
}

#[repr(C)]
struct SegmentHeader {
    magic: AtomicU64,
    capacity: AtomicU64,
    cursor: AtomicU64,
    _reserved: AtomicU64,
    roots: [RootSlot; MAX_ROOTS],
}

/// Where an arena's bytes live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArenaKind {
    Heap,
    Shared { path: PathBuf },
}

enum Backing {
    Heap { layout: Layout },
    Mapped { _map: MmapMut, owner: bool },
}

pub struct Arena {
    base: NonNull<u8>,
    len: usize,
    kind: ArenaKind,
    backing: Backing,
}

// SAFETY: the arena only hands out shared references to `ArenaValue` types (all interior
// mutability is atomic or guarded by a process-shared mutex) and raw byte pointers whose access is
// serialized by the owning object's lock.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("kind", &self.kind)
            .field("capacity", &self.len)
            .field("used", &self.used())
            .finish()
    }
}

fn header_len() -> u64 {
    align_up(std::mem::size_of::<SegmentHeader>() as u64, SEGMENT_ALIGN as u64)
}

pub(crate) fn align_up(v: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

/// FNV-1a, used to key named roots.
fn root_key(name: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in name.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h.max(1)
}

/// Directory used for named segments when none is configured.
pub fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn validate_name(name: &str) -> StreamResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') {
        return Err(StreamError::validation(format!(
            "invalid shared memory segment name '{name}'"
        )));
    }
    Ok(())
}

impl Arena {
    /// Process-local arena of `capacity` bytes.
    pub fn heap(capacity: usize) -> StreamResult<Arc<Self>> {
        let capacity = capacity.max(header_len() as usize);
        let layout = Layout::from_size_align(capacity, SEGMENT_ALIGN)
            .map_err(|e| StreamError::allocation(format!("bad arena layout: {e}")))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or_else(|| {
            StreamError::allocation(format!("failed to allocate {capacity} byte heap arena"))
        })?;
        let arena = Self {
            base,
            len: capacity,
            kind: ArenaKind::Heap,
            backing: Backing::Heap { layout },
        };
        arena.init_header();
        Ok(Arc::new(arena))
    }

    /// Create (or replace) the named segment `dir/name` and map it. The creating arena removes the
    /// backing file when dropped.
    pub fn create_shared(dir: &Path, name: &str, capacity: usize) -> StreamResult<Arc<Self>> {
        validate_name(name)?;
        let capacity = capacity.max(header_len() as usize);
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                StreamError::shm(format!("failed to create segment '{}': {e}", path.display()))
            })?;
        file.set_len(capacity as u64).map_err(|e| {
            StreamError::allocation(format!(
                "failed to size segment '{}' to {capacity} bytes: {e}",
                path.display()
            ))
        })?;
        // SAFETY: the file was just created and sized by us; other processes only touch it through
        // the atomic header and arena objects.
        let mut map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| StreamError::shm(format!("failed to map '{}': {e}", path.display())))?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| StreamError::shm("mapping returned a null base"))?;
        let arena = Self {
            base,
            len: capacity,
            kind: ArenaKind::Shared { path },
            backing: Backing::Mapped {
                _map: map,
                owner: true,
            },
        };
        arena.init_header();
        tracing::debug!(name, capacity, "created shared arena");
        Ok(Arc::new(arena))
    }

    /// Map an existing named segment created by another process (or another arena).
    pub fn open_shared(dir: &Path, name: &str) -> StreamResult<Arc<Self>> {
        validate_name(name)?;
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                StreamError::shm(format!("failed to open segment '{}': {e}", path.display()))
            })?;
        // SAFETY: see `create_shared`.
        let mut map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| StreamError::shm(format!("failed to map '{}': {e}", path.display())))?;
        let len = map.len();
        if len < header_len() as usize {
            return Err(StreamError::shm(format!(
                "segment '{}' is too small ({len} bytes)",
                path.display()
            )));
        }
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| StreamError::shm("mapping returned a null base"))?;
        let arena = Self {
            base,
            len,
            kind: ArenaKind::Shared { path },
            backing: Backing::Mapped {
                _map: map,
                owner: false,
            },
        };
        let header = arena.header();
        if header.magic.load(Ordering::Acquire) != MAGIC {
            return Err(StreamError::shm(format!(
                "segment '{name}' has not been initialised by a producer"
            )));
        }
        if header.capacity.load(Ordering::Acquire) != len as u64 {
            return Err(StreamError::shm(format!(
                "segment '{name}' capacity does not match its mapping"
            )));
        }
        Ok(Arc::new(arena))
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: the base is 64-byte aligned, the segment is at least `header_len` bytes and
        // `SegmentHeader` is all atomics.
        unsafe { &*(self.base.as_ptr() as *const SegmentHeader) }
    }

    fn init_header(&self) {
        let h = self.header();
        h.capacity.store(self.len as u64, Ordering::Relaxed);
        h.cursor.store(header_len(), Ordering::Relaxed);
        for slot in &h.roots {
            slot.key.store(0, Ordering::Relaxed);
            slot.offset.store(0, Ordering::Relaxed);
        }
        h.magic.store(MAGIC, Ordering::Release);
    }

    pub fn kind(&self) -> &ArenaKind {
        &self.kind
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn used(&self) -> usize {
        self.header().cursor.load(Ordering::Acquire) as usize
    }

    /// Reserve `size` zeroed bytes aligned to `align`. Allocation is lock-free and safe to race
    /// across processes; memory is never returned to the arena.
    pub fn alloc_bytes(&self, size: usize, align: usize) -> StreamResult<u64> {
        let align = align.max(1).next_power_of_two() as u64;
        let cursor = &self.header().cursor;
        let mut cur = cursor.load(Ordering::Acquire);
        loop {
            let start = align_up(cur, align);
            let end = start
                .checked_add(size as u64)
                .filter(|end| *end <= self.len as u64)
                .ok_or_else(|| {
                    StreamError::allocation(format!(
                        "arena exhausted: {size} bytes requested, {} of {} used",
                        cur, self.len
                    ))
                })?;
            match cursor.compare_exchange_weak(cur, end, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(start),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn alloc<T: ArenaValue>(&self) -> StreamResult<Offset<T>> {
        let off = self.alloc_bytes(std::mem::size_of::<T>(), std::mem::align_of::<T>())?;
        Ok(Offset::from_raw(off))
    }

    fn check_range(&self, off: u64, size: usize, align: usize) -> StreamResult<()> {
        let end = off.checked_add(size as u64);
        let in_bounds = off >= header_len() && end.is_some_and(|end| end <= self.len as u64);
        if !in_bounds || !off.is_multiple_of(align as u64) {
            return Err(StreamError::shm(format!(
                "offset {off:#x} (+{size}) is outside the arena or misaligned"
            )));
        }
        Ok(())
    }

    /// Resolve an offset in this process's mapping.
    pub fn get<T: ArenaValue>(&self, off: Offset<T>) -> StreamResult<&T> {
        self.check_range(off.raw, std::mem::size_of::<T>(), std::mem::align_of::<T>())?;
        // SAFETY: bounds and alignment checked; `ArenaValue` guarantees any bit pattern written by
        // zeroing or by a cooperating process is a valid `T` accessed only through shared refs.
        Ok(unsafe { &*(self.base.as_ptr().add(off.raw as usize) as *const T) })
    }

    /// Raw pointer to `len` bytes at `off`. Callers serialize access through the owning object's
    /// lock.
    pub(crate) fn bytes_ptr(&self, off: u64, len: usize) -> StreamResult<*mut u8> {
        self.check_range(off, len, 1)?;
        // SAFETY: bounds checked above.
        Ok(unsafe { self.base.as_ptr().add(off as usize) })
    }

    /// Copy `src` into the arena at `off`. Callers hold the lock of the object owning the range.
    pub(crate) fn copy_in(&self, off: u64, src: &[u8]) -> StreamResult<()> {
        let dst = self.bytes_ptr(off, src.len())?;
        // SAFETY: range checked by `bytes_ptr`; `src` is a Rust slice and cannot alias arena memory
        // handed out as `&mut`.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(())
    }

    /// Copy `dst.len()` bytes at `off` out of the arena. Same locking rule as [`Arena::copy_in`].
    pub(crate) fn copy_out(&self, off: u64, dst: &mut [u8]) -> StreamResult<()> {
        let src = self.bytes_ptr(off, dst.len())?;
        // SAFETY: range checked by `bytes_ptr`.
        unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Publish `off` under `name` so another process can find it after mapping the segment.
    pub fn set_root<T>(&self, name: &str, off: Offset<T>) -> StreamResult<()> {
        let key = root_key(name);
        let roots = &self.header().roots;
        for slot in roots {
            let existing = slot.key.load(Ordering::Acquire);
            if existing == key
                || (existing == 0
                    && slot
                        .key
                        .compare_exchange(0, key, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok())
            {
                slot.offset.store(off.raw, Ordering::Release);
                return Ok(());
            }
        }
        Err(StreamError::shm(format!(
            "no free root slot for '{name}' (max {MAX_ROOTS})"
        )))
    }

    pub fn root<T>(&self, name: &str) -> StreamResult<Offset<T>> {
        let key = root_key(name);
        self.header()
            .roots
            .iter()
            .find(|slot| slot.key.load(Ordering::Acquire) == key)
            .map(|slot| Offset::from_raw(slot.offset.load(Ordering::Acquire)))
            .filter(|off| !off.is_null())
            .ok_or_else(|| StreamError::shm(format!("root object '{name}' not found")))
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Heap { layout } => {
                // SAFETY: allocated in `Arena::heap` with this exact layout.
                unsafe { std::alloc::dealloc(self.base.as_ptr(), *layout) };
            }
            Backing::Mapped { owner, .. } => {
                if *owner && let ArenaKind::Shared { path } = &self.kind {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
    }
}
