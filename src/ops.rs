//! Collection operations composed from the buffer primitives.

use std::fmt;
use std::ops::RangeBounds;

use bytemuck::Pod;

use crate::buffer::MmapBuffer;
use crate::errors::Result;

impl<T: Pod> MmapBuffer<T> {
    /// Element at `index`, if in bounds.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Overwrite the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the region is shared and cannot be copied.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`.
    #[track_caller]
    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        let len = self.len();
        assert!(index < len, "index {index} out of range for length {len}");
        self.as_mut_slice()?[index] = value;
        Ok(())
    }

    /// Insert `value` at `index`, shifting later elements up.
    ///
    /// # Errors
    ///
    /// Returns an error if a region must be copied or grown and that fails.
    ///
    /// # Panics
    ///
    /// Panics if `index > len`.
    #[track_caller]
    pub fn insert(&mut self, index: usize, value: T) -> Result<()> {
        let len = self.len();
        assert!(index <= len, "insertion index {index} out of range for length {len}");
        self.replace_subrange(index..index, std::iter::once(value))
    }

    /// Insert a copy of `items` at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if a region must be copied or grown and that fails.
    ///
    /// # Panics
    ///
    /// Panics if `index > len`.
    #[track_caller]
    pub fn insert_slice(&mut self, index: usize, items: &[T]) -> Result<()> {
        self.replace_subrange(index..index, items.iter().copied())
    }

    /// Remove and return the element at `index`, shifting later elements down.
    ///
    /// # Errors
    ///
    /// Returns an error if the region is shared and cannot be copied.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`.
    #[track_caller]
    pub fn remove(&mut self, index: usize) -> Result<T> {
        let len = self.len();
        assert!(index < len, "removal index {index} out of range for length {len}");
        let value = self.as_slice()[index];
        self.replace_subrange(index..=index, std::iter::empty())?;
        Ok(value)
    }

    /// Remove the elements in `range`.
    ///
    /// # Errors
    ///
    /// Returns an error if the region is shared and cannot be copied.
    ///
    /// # Panics
    ///
    /// Panics if `range` is out of bounds.
    pub fn remove_range<R: RangeBounds<usize>>(&mut self, range: R) -> Result<()> {
        self.replace_subrange(range, std::iter::empty())
    }

    /// Remove and return the last element.
    ///
    /// # Errors
    ///
    /// Returns an error if the region is shared and cannot be copied.
    pub fn pop(&mut self) -> Result<Option<T>> {
        let Some(&last) = self.as_slice().last() else {
            return Ok(None);
        };
        self.truncate(self.len() - 1)?;
        Ok(Some(last))
    }

    /// Keep only the first `len` elements. No-op if already shorter.
    ///
    /// # Errors
    ///
    /// Returns an error if the region is shared and cannot be copied.
    pub fn truncate(&mut self, len: usize) -> Result<()> {
        if len >= self.len() {
            return Ok(());
        }
        self.region_mut()?.truncate(len);
        Ok(())
    }

    /// New buffer, under the same storage option, holding `f` of every element.
    ///
    /// # Errors
    ///
    /// Returns an error if the new buffer's region cannot be mapped.
    pub fn map<U, F>(&self, f: F) -> Result<MmapBuffer<U>>
    where
        U: Pod,
        F: FnMut(&T) -> U,
    {
        let mut out = MmapBuffer::with_capacity(self.len(), self.storage().clone())?;
        out.extend_from_iter(self.iter().map(f))?;
        Ok(out)
    }

    /// New buffer, under the same storage option, holding the elements for
    /// which `predicate` holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the new buffer's region cannot be mapped.
    pub fn filter<P>(&self, mut predicate: P) -> Result<Self>
    where
        P: FnMut(&T) -> bool,
    {
        MmapBuffer::from_iter_in(
            self.iter().copied().filter(|v| predicate(v)),
            self.storage().clone(),
        )
    }

    /// New buffer, under the same storage option, holding every `Some`
    /// produced by `f`.
    ///
    /// # Errors
    ///
    /// Returns an error if the new buffer's region cannot be mapped.
    pub fn compact_map<U, F>(&self, f: F) -> Result<MmapBuffer<U>>
    where
        U: Pod,
        F: FnMut(&T) -> Option<U>,
    {
        MmapBuffer::from_iter_in(self.iter().filter_map(f), self.storage().clone())
    }

    /// Copy the live elements into a `Vec`.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.as_slice().to_vec()
    }
}

impl<'a, T: Pod> IntoIterator for &'a MmapBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_slice().iter()
    }
}

impl<T: Pod + PartialEq> PartialEq for MmapBuffer<T> {
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.shares_storage_with(other) || self.as_slice() == other.as_slice()
    }
}

impl<T: Pod + Eq> Eq for MmapBuffer<T> {}

impl<T: Pod + PartialEq> PartialEq<[T]> for MmapBuffer<T> {
    fn eq(&self, other: &[T]) -> bool {
        self.as_slice() == other
    }
}

impl<T: Pod + fmt::Debug> fmt::Debug for MmapBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl<T: Pod> TryFrom<&[T]> for MmapBuffer<T> {
    type Error = crate::errors::MmapBufferError;

    fn try_from(items: &[T]) -> Result<Self> {
        Self::from_slice(items, crate::storage::StorageOption::InMemory)
    }
}
