//! Copy-on-write element buffer over a shared mapped region.

use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use bytemuck::Pod;
use log::trace;

use crate::errors::Result;
use crate::region::Region;
use crate::storage::StorageOption;
use crate::utils::{grown_capacity, replaced_len, resolve_range};

/// Growable, copy-on-write sequence of plain-data elements stored in a
/// memory mapping.
///
/// Cloning is O(1): both handles share one region until either of them is
/// mutated, at which point the mutating handle takes a private copy. Every
/// mutator takes `&mut self`, so the uniqueness check and the write that
/// follows it can never race with another handle.
///
/// # Examples
///
/// ```
/// use mmap_buffer::MmapBuffer;
///
/// let mut a = MmapBuffer::<u32>::new();
/// a.extend_from_slice(&[1, 2, 3])?;
///
/// let mut b = a.clone();
/// b.push(4)?;
///
/// assert_eq!(a.as_slice(), &[1, 2, 3]);
/// assert_eq!(b.as_slice(), &[1, 2, 3, 4]);
/// # Ok::<(), mmap_buffer::MmapBufferError>(())
/// ```
pub struct MmapBuffer<T: Pod> {
    pub(crate) region: Arc<Region<T>>,
}

impl<T: Pod> Clone for MmapBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            region: Arc::clone(&self.region),
        }
    }
}

impl<T: Pod> Default for MmapBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Pod> MmapBuffer<T> {
    /// Empty in-memory buffer. Maps nothing until the first element arrives.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[must_use]
    pub fn new() -> Self {
        Self::new_in(StorageOption::InMemory)
    }

    /// Empty buffer using `storage` for every region it will ever map.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[must_use]
    pub fn new_in(storage: StorageOption) -> Self {
        Self {
            region: Arc::new(Region::empty(storage)),
        }
    }

    /// Empty buffer with room for at least `capacity` elements.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping (or its backing file) cannot be created.
    pub fn with_capacity(capacity: usize, storage: StorageOption) -> Result<Self> {
        Ok(Self {
            region: Arc::new(Region::create(capacity, storage)?),
        })
    }

    /// Buffer holding `count` copies of `value`.
    ///
    /// An all-zero `value` costs no writes: a freshly mapped region is
    /// already zero-filled by the kernel.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping (or its backing file) cannot be created.
    pub fn repeating(value: T, count: usize, storage: StorageOption) -> Result<Self> {
        let mut region = Region::create(count, storage)?;
        if region.fill_repeating(value, count) {
            trace!("zero-filled {count} elements without writing");
        }
        Ok(Self {
            region: Arc::new(region),
        })
    }

    /// Buffer holding a copy of `items`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping (or its backing file) cannot be created.
    pub fn from_slice(items: &[T], storage: StorageOption) -> Result<Self> {
        let mut region = Region::create(items.len(), storage)?;
        region.extend_from_slice_within(items);
        Ok(Self {
            region: Arc::new(region),
        })
    }

    /// Buffer holding every item of `iter`.
    ///
    /// # Errors
    ///
    /// Returns an error if a mapping cannot be created or grown.
    pub fn from_iter_in<I>(iter: I, storage: StorageOption) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
    {
        let mut buffer = Self::new_in(storage);
        buffer.extend_from_iter(iter)?;
        Ok(buffer)
    }

    /// Number of live elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// Whether the buffer holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements the current region can hold without growing.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Size of the current mapping in bytes (a multiple of the page size, or 0).
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.region.mapped_bytes()
    }

    /// Storage choice this buffer propagates to its regions.
    #[must_use]
    pub fn storage(&self) -> &StorageOption {
        self.region.storage()
    }

    /// Path of the current backing file, for file-backed buffers that have
    /// mapped one.
    #[must_use]
    pub fn backing_path(&self) -> Option<&Path> {
        self.region.backing_path()
    }

    /// Whether `self` and `other` currently share one region.
    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }

    /// Address of element 0. Dangling (but non-null) when nothing is mapped.
    #[must_use]
    pub fn as_ptr(&self) -> *const T {
        self.region.as_ptr()
    }

    /// The live elements.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        self.region.as_slice()
    }

    /// The live elements as raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.region.as_bytes()
    }

    /// Run `body` over a read-only view of the live elements.
    pub fn with_unsafe_buffer<R>(&self, body: impl FnOnce(&[T]) -> R) -> R {
        body(self.as_slice())
    }

    /// Run `body` over a writable view of the live elements, taking a
    /// private copy of the region first if it is shared.
    ///
    /// The view may be written through but never resized or relocated.
    ///
    /// # Errors
    ///
    /// Returns an error if a private copy is needed and cannot be mapped.
    pub fn with_unsafe_mutable_buffer<R>(&mut self, body: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        let slice = self.as_mut_slice()?;
        let (base, len) = (slice.as_ptr(), slice.len());
        let out = body(slice);
        assert!(
            self.region.as_ptr() == base && self.region.len() == len,
            "buffer view was relocated or resized"
        );
        Ok(out)
    }

    /// Writable view of the live elements, unsharing the region first.
    ///
    /// # Errors
    ///
    /// Returns an error if a private copy is needed and cannot be mapped.
    pub fn as_mut_slice(&mut self) -> Result<&mut [T]> {
        Ok(self.region_mut()?.as_mut_slice())
    }

    /// Append one element, growing the region if it is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the region must be copied or grown and that fails.
    pub fn push(&mut self, item: T) -> Result<()> {
        let region = self.region_mut()?;
        if let Err(item) = region.try_push(item) {
            let target = grown_capacity(region.capacity(), region.len() + 1);
            region.extend_capacity(target)?;
            if region.try_push(item).is_err() {
                unreachable!("region grown to fit one more element");
            }
        }
        Ok(())
    }

    /// Append every item of `iter`.
    ///
    /// Room for the iterator's lower size bound is reserved up front; items
    /// beyond that are appended one by one.
    ///
    /// # Errors
    ///
    /// Returns an error if the region must be copied or grown and that fails.
    /// Items appended before the failure stay in the buffer.
    pub fn extend_from_iter<I>(&mut self, iter: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
    {
        let mut iter = iter.into_iter();
        let (lower, _) = iter.size_hint();
        let wanted = self.len().saturating_add(lower);
        self.reserve_amortized(wanted)?;
        self.region_mut()?.extend_within(&mut iter);
        for item in iter {
            self.push(item)?;
        }
        Ok(())
    }

    /// Append a copy of `items`.
    ///
    /// # Errors
    ///
    /// Returns an error if the region must be copied or grown and that fails.
    pub fn extend_from_slice(&mut self, items: &[T]) -> Result<()> {
        let wanted = self.len().saturating_add(items.len());
        self.reserve_amortized(wanted)?;
        self.region_mut()?.extend_from_slice_within(items);
        Ok(())
    }

    /// Make sure the buffer can hold `min_capacity` elements without growing.
    ///
    /// Never shrinks and never changes the contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the region must be copied or grown and that fails.
    pub fn reserve(&mut self, min_capacity: usize) -> Result<()> {
        if self.capacity() >= min_capacity && self.is_unique() {
            return Ok(());
        }
        let region = self.region_mut()?;
        region.extend_capacity(min_capacity)
    }

    /// Replace the elements in `range` with `new_elements`.
    ///
    /// # Errors
    ///
    /// Returns `CapacityOverflow` if the resulting length does not fit in
    /// `usize`, or an error if a new region is needed and cannot be mapped.
    /// The buffer is unchanged in both cases.
    ///
    /// # Panics
    ///
    /// Panics if `range` is out of bounds, or if `new_elements` yields a
    /// different number of items than its `len()` reports.
    pub fn replace_subrange<R, I>(&mut self, range: R, new_elements: I) -> Result<()>
    where
        R: RangeBounds<usize>,
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        let range = resolve_range(range, self.len());
        let new_elements = new_elements.into_iter();
        let new_count = replaced_len(
            self.len(),
            range.len(),
            new_elements.len(),
            std::mem::size_of::<T>(),
        )?;

        if let Some(region) = Arc::get_mut(&mut self.region) {
            if region.capacity() >= new_count {
                region.replace_in_place(range, new_elements);
                return Ok(());
            }
        }
        let capacity = if new_count > self.capacity() {
            grown_capacity(self.capacity(), new_count)
        } else {
            self.capacity()
        };
        let fresh = self.region.replaced(range, new_elements, capacity)?;
        self.region = Arc::new(fresh);
        Ok(())
    }

    /// Remove every element.
    ///
    /// With `keep_capacity` the mapping (or an equally sized private one, if
    /// the region is shared) is kept for reuse; otherwise the buffer drops
    /// back to zero capacity.
    ///
    /// # Errors
    ///
    /// Returns an error only when `keep_capacity` is set, the region is
    /// shared, and a fresh mapping of the same size cannot be created.
    pub fn remove_all(&mut self, keep_capacity: bool) -> Result<()> {
        if !keep_capacity {
            self.region = Arc::new(Region::empty(self.storage().clone()));
            return Ok(());
        }
        match Arc::get_mut(&mut self.region) {
            Some(region) => region.truncate(0),
            None => {
                let fresh = Region::create(self.capacity(), self.storage().clone())?;
                self.region = Arc::new(fresh);
            }
        }
        Ok(())
    }

    /// Remove every element without mapping anything.
    ///
    /// An unshared region keeps its capacity; a shared one is released and
    /// the buffer drops back to zero capacity.
    pub fn clear(&mut self) {
        match Arc::get_mut(&mut self.region) {
            Some(region) => region.truncate(0),
            None => self.region = Arc::new(Region::empty(self.storage().clone())),
        }
    }

    /// Whether this handle is the only one referencing its region.
    pub(crate) fn is_unique(&mut self) -> bool {
        Arc::get_mut(&mut self.region).is_some()
    }

    /// Exclusive access to the region, copying it first if it is shared.
    pub(crate) fn region_mut(&mut self) -> Result<&mut Region<T>> {
        self.make_unique_if_needed()?;
        Ok(Arc::get_mut(&mut self.region).unwrap_or_else(|| {
            unreachable!("region is unique after make_unique_if_needed")
        }))
    }

    /// Replace a shared region with a private copy of the same capacity.
    pub(crate) fn make_unique_if_needed(&mut self) -> Result<()> {
        if self.is_unique() {
            return Ok(());
        }
        let fresh = self.region.try_clone_with_capacity(self.capacity())?;
        trace!(
            "unshared region of {} elements ({} bytes)",
            fresh.len(),
            fresh.mapped_bytes()
        );
        self.region = Arc::new(fresh);
        Ok(())
    }

    /// Reserve with geometric growth, so repeated appends stay amortized O(1).
    fn reserve_amortized(&mut self, wanted: usize) -> Result<()> {
        let region = self.region_mut()?;
        if region.capacity() < wanted {
            let target = grown_capacity(region.capacity(), wanted);
            region.extend_capacity(target)?;
        }
        Ok(())
    }
}

impl<T: Pod> std::ops::Deref for MmapBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Pod> AsRef<[T]> for MmapBuffer<T> {
    fn as_ref(&self) -> &[T] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_maps_nothing() {
        let buf = MmapBuffer::<u8>::new();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 0);
        assert_eq!(buf.mapped_bytes(), 0);
        assert_eq!(buf.storage(), &StorageOption::InMemory);
    }

    #[test]
    fn push_grows_geometrically() {
        let mut buf = MmapBuffer::<u64>::new();
        buf.push(1).expect("push");
        let first = buf.capacity();
        assert!(first >= 1);
        for i in 0..first as u64 {
            buf.push(i).expect("push");
        }
        assert!(buf.capacity() >= 2 * first);
        assert_eq!(buf.len(), first + 1);
    }

    #[test]
    fn clone_shares_until_mutation() {
        let a = MmapBuffer::from_slice(&[1u16, 2, 3], StorageOption::InMemory).expect("from");
        let mut b = a.clone();
        assert!(a.shares_storage_with(&b));
        b.push(4).expect("push");
        assert!(!a.shares_storage_with(&b));
        assert_eq!(a.as_slice(), &[1, 2, 3]);
        assert_eq!(b.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn unique_mutation_stays_in_place() {
        let mut buf = MmapBuffer::<u32>::with_capacity(16, StorageOption::InMemory).expect("cap");
        buf.push(1).expect("push");
        let before = buf.as_ptr();
        buf.push(2).expect("push");
        buf.as_mut_slice().expect("slice")[0] = 9;
        assert_eq!(buf.as_ptr(), before);
        assert_eq!(buf.as_slice(), &[9, 2]);
    }

    #[test]
    fn make_unique_keeps_capacity() {
        let a = MmapBuffer::<u8>::with_capacity(10_000, StorageOption::InMemory).expect("cap");
        let mut b = a.clone();
        b.make_unique_if_needed().expect("unique");
        assert!(!a.shares_storage_with(&b));
        assert_eq!(a.capacity(), b.capacity());
    }

    #[test]
    fn extend_from_iter_handles_unknown_lengths() {
        let mut buf = MmapBuffer::<u32>::new();
        buf.extend_from_iter((0..5000).filter(|v| v % 2 == 0))
            .expect("extend");
        assert_eq!(buf.len(), 2500);
        assert!(buf.iter().copied().eq((0..5000).filter(|v| v % 2 == 0)));
    }

    #[test]
    fn reserve_never_shrinks() {
        let mut buf = MmapBuffer::from_slice(&[1u8, 2], StorageOption::InMemory).expect("from");
        let cap = buf.capacity();
        buf.reserve(1).expect("reserve");
        assert_eq!(buf.capacity(), cap);
        buf.reserve(cap * 5).expect("reserve");
        assert!(buf.capacity() >= cap * 5);
        assert_eq!(buf.as_slice(), &[1, 2]);
    }

    #[test]
    fn replace_subrange_in_place_and_out_of_place() {
        let mut buf = MmapBuffer::from_slice(&[0u8, 1, 2, 3], StorageOption::InMemory).expect("from");
        buf.replace_subrange(1..3, [7, 7, 7]).expect("replace");
        assert_eq!(buf.as_slice(), &[0, 7, 7, 7, 3]);

        let shared = buf.clone();
        buf.replace_subrange(..1, []).expect("replace");
        assert_eq!(buf.as_slice(), &[7, 7, 7, 3]);
        assert_eq!(shared.as_slice(), &[0, 7, 7, 7, 3]);

        let cap = buf.capacity();
        let big = vec![1u8; cap + 1];
        buf.replace_subrange(4.., big.iter().copied()).expect("replace");
        assert_eq!(buf.len(), 4 + cap + 1);
        assert!(buf.capacity() >= buf.len());
        assert_eq!(&buf[..4], &[7, 7, 7, 3]);
    }

    #[test]
    fn remove_all_variants() {
        let mut buf = MmapBuffer::from_slice(&[1u32; 100], StorageOption::InMemory).expect("from");
        let cap = buf.capacity();

        buf.remove_all(true).expect("keep");
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);

        buf.extend_from_slice(&[5; 3]).expect("extend");
        let other = buf.clone();
        buf.remove_all(true).expect("keep shared");
        assert_eq!(buf.capacity(), cap);
        assert_eq!(other.as_slice(), &[5, 5, 5]);

        buf.remove_all(false).expect("release");
        assert_eq!(buf.capacity(), 0);
        assert_eq!(buf.mapped_bytes(), 0);
    }

    #[test]
    fn clear_on_shared_buffer_releases() {
        let mut a = MmapBuffer::from_slice(&[1u8, 2], StorageOption::InMemory).expect("from");
        let b = a.clone();
        a.clear();
        assert!(a.is_empty());
        assert_eq!(b.as_slice(), &[1, 2]);
    }

    #[test]
    fn mutable_buffer_view_unshares() {
        let a = MmapBuffer::from_slice(&[1i32, 2, 3], StorageOption::InMemory).expect("from");
        let mut b = a.clone();
        let sum = b
            .with_unsafe_mutable_buffer(|s| {
                s.iter_mut().for_each(|v| *v *= 10);
                s.iter().sum::<i32>()
            })
            .expect("view");
        assert_eq!(sum, 60);
        assert_eq!(a.as_slice(), &[1, 2, 3]);
        assert_eq!(b.with_unsafe_buffer(|s| s.to_vec()), vec![10, 20, 30]);
    }

    #[test]
    fn repeating_non_zero() {
        let buf = MmapBuffer::repeating(0xABu8, 10, StorageOption::InMemory).expect("repeat");
        assert_eq!(buf.as_slice(), &[0xAB; 10]);
    }
}
