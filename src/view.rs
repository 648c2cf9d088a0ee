//! Zero-copy views that keep their region mapped.

use std::ops::Deref;
use std::sync::Arc;

use bytemuck::Pod;

use crate::buffer::MmapBuffer;
use crate::region::Region;

/// Immutable snapshot of a buffer's live span, valid for as long as the view
/// exists.
///
/// The view holds its own reference to the region, so the mapping cannot be
/// released underneath it. Holding a view also makes the region shared: the
/// next mutation of the source buffer takes a private copy, and the view
/// keeps showing the contents it was created with.
///
/// # Examples
///
/// ```
/// use mmap_buffer::{MmapBuffer, StorageOption};
///
/// let mut pixels = MmapBuffer::from_slice(&[0x11u8, 0x22], StorageOption::InMemory)?;
/// let view = pixels.byte_view();
/// pixels.push(0x33)?;
///
/// assert_eq!(&*view, &[0x11, 0x22]);
/// assert_eq!(pixels.as_slice(), &[0x11, 0x22, 0x33]);
/// # Ok::<(), mmap_buffer::MmapBufferError>(())
/// ```
pub struct ByteView<T: Pod> {
    region: Arc<Region<T>>,
}

impl<T: Pod> Clone for ByteView<T> {
    fn clone(&self) -> Self {
        Self {
            region: Arc::clone(&self.region),
        }
    }
}

impl<T: Pod> std::fmt::Debug for ByteView<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteView")
            .field("len", &self.len())
            .field("region", &self.region)
            .finish()
    }
}

impl<T: Pod> ByteView<T> {
    /// Length of the view in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the view covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live span as bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.region.as_bytes()
    }

    /// The live span as elements.
    #[must_use]
    pub fn as_elements(&self) -> &[T] {
        self.region.as_slice()
    }

    /// Base address of the span. Valid while this view is alive.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.as_bytes().as_ptr()
    }
}

impl<T: Pod> Deref for ByteView<T> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl<T: Pod> AsRef<[u8]> for ByteView<T> {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl<T: Pod> MmapBuffer<T> {
    /// Zero-copy byte view of the live span that keeps the region alive.
    #[must_use]
    pub fn byte_view(&self) -> ByteView<T> {
        ByteView {
            region: Arc::clone(&self.region),
        }
    }
}
