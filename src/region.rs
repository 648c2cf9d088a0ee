//! Mapped storage for buffer elements.
//!
//! A [`Region`] owns at most one virtual-memory mapping, either anonymous or
//! backed by an exclusively locked temp file, plus the count of live
//! elements at its start. All raw pointer arithmetic in the crate lives in
//! this module; everything above it works with slices.

use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

use bytemuck::Pod;
use log::{debug, trace, warn};
use memmap2::MmapMut;

use crate::errors::{MmapBufferError, Result};
use crate::storage::{SpillConfig, StorageOption};
use crate::utils::{mapped_bytes_for, page_size, replaced_len};

// Random characters appended to the spill file prefix.
const SPILL_SUFFIX_LEN: usize = 12;

const ERR_ZERO_SIZED: &str = "zero-sized element types are not supported";

/// Elements stored in a mapped region, starting at a page-aligned address.
pub(crate) struct Region<T> {
    mapping: Mapping,
    base: NonNull<T>,
    mapped_bytes: usize,
    live: usize,
    // True from creation until the first write or extension: every byte of
    // the mapping is still the kernel's zero fill.
    pristine: bool,
    storage: StorageOption,
    _marker: PhantomData<T>,
}

// SAFETY: the region exclusively owns its mapping; `Pod` rules out interior
// mutability, so shared access only ever reads plain bytes.
unsafe impl<T: Pod + Send> Send for Region<T> {}
// SAFETY: see above; mutation requires `&mut Region`.
unsafe impl<T: Pod + Sync> Sync for Region<T> {}

impl<T: Pod> std::fmt::Debug for Region<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("storage", &self.storage)
            .field("path", &self.backing_path())
            .field("mapped_bytes", &self.mapped_bytes)
            .field("live", &self.live)
            .finish()
    }
}

impl<T: Pod> Region<T> {
    const STRIDE: usize = mem::size_of::<T>();

    /// Zero-capacity region with no mapping.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    pub(crate) fn empty(storage: StorageOption) -> Self {
        assert!(Self::STRIDE != 0, "{ERR_ZERO_SIZED}");
        Self {
            mapping: Mapping::None,
            base: NonNull::dangling(),
            mapped_bytes: 0,
            live: 0,
            pristine: true,
            storage,
            _marker: PhantomData,
        }
    }

    /// Map a fresh region able to hold at least `capacity` elements.
    ///
    /// A capacity of zero yields [`Region::empty`]; nothing is mapped and no
    /// file is created until an element needs room.
    ///
    /// # Errors
    ///
    /// Returns `CapacityOverflow` if the size is not representable,
    /// `OutOfMemory` / `MapFailed` if mapping fails, and
    /// `FileCreateFailed` / `LockFailed` / `TruncateFailed` for file-backed
    /// storage.
    pub(crate) fn create(capacity: usize, storage: StorageOption) -> Result<Self> {
        if capacity == 0 {
            return Ok(Self::empty(storage));
        }
        assert!(Self::STRIDE != 0, "{ERR_ZERO_SIZED}");
        assert!(
            mem::align_of::<T>() <= page_size(),
            "element alignment exceeds the page size"
        );
        let bytes = mapped_bytes_for(capacity, Self::STRIDE)?;
        let mut mapping = match &storage {
            StorageOption::InMemory => Mapping::Anon(AnonMap::new(bytes)?),
            StorageOption::FileBacked(config) => Mapping::File(FileMap::create(config, bytes)?),
        };
        let base = mapping.base();
        debug!(
            "mapped {} bytes ({} x {}-byte elements) at {:p}, {}",
            bytes,
            bytes / Self::STRIDE,
            Self::STRIDE,
            base,
            mapping.describe()
        );
        Ok(Self {
            mapping,
            base: base.cast(),
            mapped_bytes: bytes,
            live: 0,
            pristine: true,
            storage,
            _marker: PhantomData,
        })
    }

    /// Number of elements the current mapping can hold.
    pub(crate) fn capacity(&self) -> usize {
        self.mapped_bytes / Self::STRIDE
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    pub(crate) fn storage(&self) -> &StorageOption {
        &self.storage
    }

    pub(crate) fn backing_path(&self) -> Option<&Path> {
        match &self.mapping {
            Mapping::File(file) => Some(&file.backing.path),
            Mapping::None | Mapping::Anon(_) => None,
        }
    }

    pub(crate) fn as_ptr(&self) -> *const T {
        self.base.as_ptr()
    }

    pub(crate) fn as_slice(&self) -> &[T] {
        // SAFETY: `base` points at `live` initialized elements inside the
        // mapping (or is dangling with `live == 0`).
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.live) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [T] {
        self.pristine = false;
        // SAFETY: as in `as_slice`, and `&mut self` gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.live) }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.as_slice())
    }

    /// Base address and length of the whole mapping, if any.
    #[cfg(feature = "advise")]
    pub(crate) fn mapped_span(&self) -> Option<(*mut u8, usize)> {
        match self.mapping {
            Mapping::None => None,
            Mapping::Anon(_) | Mapping::File(_) => {
                Some((self.base.as_ptr().cast::<u8>(), self.mapped_bytes))
            }
        }
    }

    /// Grow the mapping so it holds at least `new_capacity` elements.
    ///
    /// Live elements keep their order and values; their address may change.
    /// On error the region is left exactly as it was.
    ///
    /// # Errors
    ///
    /// Same as [`Region::create`].
    pub(crate) fn extend_capacity(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity <= self.capacity() {
            return Ok(());
        }
        if matches!(self.mapping, Mapping::None) {
            let storage = self.storage.clone();
            *self = Self::create(new_capacity, storage)?;
            self.pristine = false;
            return Ok(());
        }

        let new_bytes = mapped_bytes_for(new_capacity, Self::STRIDE)?;
        let live_bytes = self.live * Self::STRIDE;
        match &mut self.mapping {
            Mapping::None => unreachable!("empty regions are recreated above"),
            Mapping::Anon(anon) => {
                if anon.try_grow_in_place(new_bytes) {
                    debug!("grew anonymous mapping in place to {new_bytes} bytes");
                } else {
                    let mut fresh = AnonMap::new(new_bytes)?;
                    // SAFETY: both mappings are at least `live_bytes` long and
                    // distinct. Elements are `Pod`, so a byte copy moves them.
                    unsafe {
                        ptr::copy_nonoverlapping(anon.as_mut_ptr(), fresh.as_mut_ptr(), live_bytes);
                    }
                    *anon = fresh;
                    debug!("moved {live_bytes} live bytes into a new {new_bytes}-byte mapping");
                }
            }
            Mapping::File(file) => {
                file.grow(new_bytes)?;
                debug!("remapped {} at {new_bytes} bytes", file.backing.path.display());
            }
        }
        self.base = self.mapping.base().cast();
        self.mapped_bytes = new_bytes;
        self.pristine = false;
        Ok(())
    }

    /// Copy the live elements into a new region of the same storage kind.
    ///
    /// The new region holds at least `capacity` elements (and never fewer
    /// than the live count).
    ///
    /// # Errors
    ///
    /// Same as [`Region::create`].
    pub(crate) fn try_clone_with_capacity(&self, capacity: usize) -> Result<Self> {
        let mut fresh = Self::create(capacity.max(self.live), self.storage.clone())?;
        fresh.extend_from_slice_within(self.as_slice());
        trace!("copied {} elements into a private region", self.live);
        Ok(fresh)
    }

    /// Build a new region holding `self[..range.start] ++ new ++ self[range.end..]`.
    ///
    /// # Errors
    ///
    /// Returns `CapacityOverflow` if the resulting length does not fit in
    /// `usize`, otherwise the same as [`Region::create`].
    ///
    /// # Panics
    ///
    /// Panics if `new` yields a different number of items than its `len()`.
    pub(crate) fn replaced<I>(&self, range: Range<usize>, new: I, capacity: usize) -> Result<Self>
    where
        I: ExactSizeIterator<Item = T>,
    {
        let new_count = replaced_len(self.live, range.len(), new.len(), Self::STRIDE)?;
        let mut fresh = Self::create(capacity.max(new_count), self.storage.clone())?;
        let (head, rest) = self.as_slice().split_at(range.start);
        let tail = &rest[range.len()..];
        fresh.extend_from_slice_within(head);
        fresh.write_exact(new);
        fresh.extend_from_slice_within(tail);
        Ok(fresh)
    }

    /// Replace `range` with the items of `new` without leaving the mapping.
    ///
    /// # Panics
    ///
    /// Panics if the result would not fit the current capacity, or if `new`
    /// yields a different number of items than its `len()`.
    pub(crate) fn replace_in_place<I>(&mut self, range: Range<usize>, new: I)
    where
        I: ExactSizeIterator<Item = T>,
    {
        debug_assert!(range.end <= self.live);
        let inserted = new.len();
        let tail = self.live - range.end;
        let fits = replaced_len(self.live, range.len(), inserted, Self::STRIDE)
            .is_ok_and(|n| n <= self.capacity());
        assert!(fits, "replacement exceeds capacity");
        let new_count = self.live - range.len() + inserted;
        self.pristine = false;

        if inserted != range.len() && tail > 0 {
            let base = self.base.as_ptr();
            // SAFETY: source and destination both lie within the first
            // `max(live, new_count) <= capacity` slots; `copy` handles overlap.
            unsafe { ptr::copy(base.add(range.end), base.add(range.start + inserted), tail) };
        }
        self.live = range.start;
        self.write_exact(new);
        self.live = new_count;
    }

    /// Append items from `iter` until it runs dry or the region is full.
    ///
    /// Returns the number of items written. Never pulls an item it has no
    /// room for.
    pub(crate) fn extend_within<I>(&mut self, iter: &mut I) -> usize
    where
        I: Iterator<Item = T>,
    {
        let start = self.live;
        let capacity = self.capacity();
        while self.live < capacity {
            let Some(item) = iter.next() else { break };
            // SAFETY: `live < capacity`, so the slot is inside the mapping.
            unsafe { self.base.as_ptr().add(self.live).write(item) };
            self.live += 1;
        }
        if self.live > start {
            self.pristine = false;
        }
        self.live - start
    }

    /// Append one element if there is room, handing it back otherwise.
    pub(crate) fn try_push(&mut self, item: T) -> std::result::Result<(), T> {
        if self.live == self.capacity() {
            return Err(item);
        }
        // SAFETY: `live < capacity`.
        unsafe { self.base.as_ptr().add(self.live).write(item) };
        self.live += 1;
        self.pristine = false;
        Ok(())
    }

    /// Append a slice that is known to fit.
    ///
    /// # Panics
    ///
    /// Panics if `src` does not fit in the remaining capacity.
    pub(crate) fn extend_from_slice_within(&mut self, src: &[T]) {
        if src.is_empty() {
            return;
        }
        assert!(src.len() <= self.capacity() - self.live, "slice exceeds capacity");
        // SAFETY: room was checked above; `src` cannot alias the spare slots
        // because we hold `&mut self`.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(self.live), src.len());
        }
        self.live += src.len();
        self.pristine = false;
    }

    /// Append `count` copies of `value` to a region with room for them.
    ///
    /// On a pristine region an all-zero `value` is already present in every
    /// slot, so only the count moves. Returns whether that shortcut was taken.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the remaining capacity.
    pub(crate) fn fill_repeating(&mut self, value: T, count: usize) -> bool {
        assert!(count <= self.capacity() - self.live, "fill exceeds capacity");
        if count == 0 {
            return false;
        }
        if self.pristine && bytemuck::bytes_of(&value).iter().all(|&b| b == 0) {
            self.live += count;
            self.pristine = false;
            return true;
        }
        let written = self.extend_within(&mut std::iter::repeat(value).take(count));
        debug_assert_eq!(written, count);
        false
    }

    /// Drop the live count to `len`, keeping the mapping.
    pub(crate) fn truncate(&mut self, len: usize) {
        if len < self.live {
            self.live = len;
        }
    }

    /// Write exactly `iter.len()` items after the live prefix.
    fn write_exact<I>(&mut self, mut iter: I)
    where
        I: ExactSizeIterator<Item = T>,
    {
        let expected = iter.len();
        assert!(expected <= self.capacity() - self.live, "replacement exceeds capacity");
        let start = self.live;
        let written = self.extend_within(&mut (&mut iter).take(expected));
        if written != expected {
            // Slots past the written items still hold valid `Pod` bytes.
            self.live = start + expected;
            panic!("iterator reported {expected} items but produced {written}");
        }
        assert!(
            iter.next().is_none(),
            "iterator reported {expected} items but produced more"
        );
    }
}

/// The mapping behind a region.
enum Mapping {
    None,
    Anon(AnonMap),
    File(FileMap),
}

impl Mapping {
    fn base(&mut self) -> NonNull<u8> {
        let ptr = match self {
            Mapping::None => return NonNull::dangling(),
            Mapping::Anon(anon) => anon.as_mut_ptr(),
            Mapping::File(file) => file.map.as_mut_ptr(),
        };
        NonNull::new(ptr).unwrap_or(NonNull::dangling())
    }

    fn describe(&self) -> String {
        match self {
            Mapping::None => "unmapped".to_owned(),
            Mapping::Anon(_) => "anonymous".to_owned(),
            Mapping::File(file) => format!("backed by {}", file.backing.path.display()),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Anonymous private mapping owned by raw pointer so it can be
        /// extended in place.
        struct AnonMap {
            ptr: NonNull<u8>,
            len: usize,
        }

        impl AnonMap {
            const PROT: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

            fn new(len: usize) -> Result<Self> {
                // SAFETY: plain anonymous mapping request, no address constraint.
                let addr = unsafe {
                    libc::mmap(ptr::null_mut(), len, Self::PROT, Self::FLAGS, -1, 0)
                };
                if addr == libc::MAP_FAILED {
                    return Err(MmapBufferError::from_map_error(io::Error::last_os_error(), len));
                }
                let ptr = NonNull::new(addr.cast::<u8>())
                    .ok_or(MmapBufferError::MapFailed(io::Error::from(io::ErrorKind::Other)))?;
                Ok(Self { ptr, len })
            }

            fn as_mut_ptr(&mut self) -> *mut u8 {
                self.ptr.as_ptr()
            }

            /// Ask for the pages right after this mapping. Only succeeds if the
            /// kernel places them exactly there.
            #[cfg(feature = "inplace-grow")]
            fn try_grow_in_place(&mut self, new_len: usize) -> bool {
                let extra = new_len - self.len;
                let hint = self.ptr.as_ptr().wrapping_add(self.len);
                // SAFETY: a hint without MAP_FIXED never clobbers existing
                // mappings; the kernel picks another address if it is taken.
                let addr = unsafe {
                    libc::mmap(hint.cast(), extra, Self::PROT, Self::FLAGS, -1, 0)
                };
                if addr == libc::MAP_FAILED {
                    return false;
                }
                if addr.cast::<u8>() == hint {
                    self.len = new_len;
                    return true;
                }
                trace!("in-place growth hint not honored, got {addr:p} instead of {hint:p}");
                // SAFETY: `addr` is the mapping we just created, `extra` long.
                unsafe { libc::munmap(addr, extra) };
                false
            }

            #[cfg(not(feature = "inplace-grow"))]
            fn try_grow_in_place(&mut self, _new_len: usize) -> bool {
                false
            }
        }

        impl Drop for AnonMap {
            fn drop(&mut self) {
                // SAFETY: `ptr..ptr+len` is exactly what this value mapped,
                // possibly as two adjacent mappings; munmap accepts both.
                let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
                if rc != 0 {
                    warn!("munmap of {} bytes failed: {}", self.len, io::Error::last_os_error());
                }
            }
        }
    } else {
        /// Anonymous mapping via memmap2; no in-place growth on this platform.
        struct AnonMap {
            map: MmapMut,
        }

        impl AnonMap {
            fn new(len: usize) -> Result<Self> {
                let map = MmapMut::map_anon(len)
                    .map_err(|e| MmapBufferError::from_map_error(e, len))?;
                Ok(Self { map })
            }

            fn as_mut_ptr(&mut self) -> *mut u8 {
                self.map.as_mut_ptr()
            }

            fn try_grow_in_place(&mut self, _new_len: usize) -> bool {
                false
            }
        }
    }
}

/// Shared read-write mapping of a spill file.
///
/// Field order matters: `map` is dropped (unmapped) before `backing`
/// truncates and removes the file.
struct FileMap {
    map: MmapMut,
    backing: BackingFile,
}

impl FileMap {
    fn create(config: &SpillConfig, len: usize) -> Result<Self> {
        let backing = BackingFile::create(config)?;
        backing.set_len(len)?;
        // SAFETY: the file is ours alone (fresh, exclusively locked) and
        // sized to `len`.
        let map = unsafe { MmapMut::map_mut(&*backing.file) }
            .map_err(|e| MmapBufferError::from_map_error(e, len))?;
        Ok(Self { map, backing })
    }

    /// Grow the file and remap it; the old mapping stays valid on failure.
    fn grow(&mut self, new_len: usize) -> Result<()> {
        let old_len = self.map.len();
        self.backing.set_len(new_len)?;
        // SAFETY: as in `create`; the file now spans `new_len` bytes.
        match unsafe { MmapMut::map_mut(&*self.backing.file) } {
            Ok(map) => {
                self.map = map;
                Ok(())
            }
            Err(e) => {
                if let Err(restore) = self.backing.set_len(old_len) {
                    warn!("could not restore backing file length: {restore}");
                }
                Err(MmapBufferError::from_map_error(e, new_len))
            }
        }
    }
}

/// An exclusively locked temp file that removes itself on drop.
struct BackingFile {
    file: ManuallyDrop<File>,
    path: PathBuf,
}

impl BackingFile {
    fn create(config: &SpillConfig) -> Result<Self> {
        let create_failed = |source: io::Error| MmapBufferError::FileCreateFailed {
            dir: config.directory().to_path_buf(),
            source,
        };
        // tempfile retries on name collisions and opens with O_EXCL.
        let named = tempfile::Builder::new()
            .prefix(config.prefix())
            .rand_bytes(SPILL_SUFFIX_LEN)
            .tempfile_in(config.directory())
            .map_err(create_failed)?;
        let (file, path) = named.keep().map_err(|e| create_failed(e.error))?;
        let backing = Self {
            file: ManuallyDrop::new(file),
            path,
        };
        backing.lock()?;
        Ok(backing)
    }

    fn set_len(&self, len: usize) -> Result<()> {
        self.file
            .set_len(len as u64)
            .map_err(|source| MmapBufferError::TruncateFailed {
                path: self.path.clone(),
                source,
            })
    }

    #[cfg(unix)]
    fn lock(&self) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is open for the lifetime of `self.file`.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(MmapBufferError::LockFailed {
                path: self.path.clone(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock(&self) -> Result<()> {
        Ok(())
    }

    #[cfg(unix)]
    fn unlock(&self) {
        use std::os::unix::io::AsRawFd;
        // SAFETY: as in `lock`.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!("unlock of {} failed: {}", self.path.display(), io::Error::last_os_error());
        }
    }

    #[cfg(not(unix))]
    fn unlock(&self) {}
}

impl Drop for BackingFile {
    fn drop(&mut self) {
        if let Err(e) = self.file.set_len(0) {
            warn!("truncate of {} failed: {e}", self.path.display());
        }
        self.unlock();
        // SAFETY: `file` is never touched again after this.
        drop(unsafe { ManuallyDrop::take(&mut self.file) });
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("removed backing file {}", self.path.display()),
            Err(e) => warn!("removal of {} failed: {e}", self.path.display()),
        }
    }
}
