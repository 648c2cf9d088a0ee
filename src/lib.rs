//! # mmap-buffer: copy-on-write element buffers in memory mappings
//!
//! This crate provides [`MmapBuffer`], a growable sequence of plain-data
//! elements whose storage is a virtual-memory mapping. The same call sites
//! work whether the mapping is anonymous memory or a temp file on disk, so
//! very large flat arrays (pixel planes, compressed byte streams) can spill
//! out of RAM without changing the code that fills and reads them.
//!
//! ## Features
//!
//! - **Value semantics**: cloning is O(1); the first mutation of a shared
//!   buffer takes a private copy
//! - **Two storage kinds**: anonymous private mappings, or exclusively
//!   locked temp files that are removed when the last handle goes away
//! - **Amortized growth**: mappings grow geometrically, in place when the
//!   kernel allows it
//! - **Zero-copy export**: [`ByteView`] exposes the live bytes and keeps the
//!   mapping alive for as long as it exists
//! - **Fallible resources**: mapping and file failures come back as
//!   [`MmapBufferError`] instead of aborting
//!
//! ## Quick Start
//!
//! ```
//! use mmap_buffer::{MmapBuffer, StorageOption};
//!
//! let dir = tempfile::tempdir()?;
//! let mut plane = MmapBuffer::repeating(0u8, 4096, StorageOption::file_backed_in(dir.path()))?;
//! plane.set(10, 0xFF)?;
//! plane.extend_from_slice(&[1, 2, 3])?;
//!
//! assert_eq!(plane.len(), 4099);
//! assert_eq!(plane[10], 0xFF);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Modules
//!
//! - [`errors`]: Error types for mapping and temp-file failures
//! - [`utils`]: Page size, alignment and range helpers
//! - [`storage`]: Storage selection and spill-file configuration
//! - [`buffer`]: The copy-on-write [`MmapBuffer`]
//! - [`view`]: Zero-copy [`ByteView`]
//! - [`advise`]: Access-pattern hints
//!
//! ## Feature Flags
//!
//! - `advise` (default): `madvise` hints via [`MmapBuffer::advise`]
//! - `inplace-grow` (default): try to extend anonymous mappings in place
//!   before falling back to map-and-move

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![deny(missing_docs)]

pub mod advise;
pub mod buffer;
pub mod errors;
mod ops;
mod region;
pub mod storage;
pub mod utils;
pub mod view;

pub use advise::MmapAdvice;
pub use buffer::MmapBuffer;
pub use errors::{ErrorClass, MmapBufferError};
pub use storage::{SpillConfig, StorageOption};
pub use view::ByteView;
