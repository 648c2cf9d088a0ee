//! Crate-specific error types for mmap-buffer.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for mmap-buffer operations.
pub type Result<T> = std::result::Result<T, MmapBufferError>;

/// Error type covering mapping, temp-file and sizing failures.
///
/// These are only raised where a region is created or grown. Misuse of the
/// API (out-of-range indices, iterators that lie about their length) is a
/// contract violation and panics instead.
#[derive(Debug, Error)]
pub enum MmapBufferError {
    /// The kernel refused to hand out address space for the mapping.
    #[error("out of memory: could not map {bytes} bytes")]
    OutOfMemory {
        /// Requested mapping size in bytes.
        bytes: usize,
    },

    /// A mapping call failed for a reason other than memory exhaustion.
    #[error("mmap failed: {0}")]
    MapFailed(#[source] io::Error),

    /// The backing temp file could not be created.
    #[error("failed to create backing file in {dir}: {source}")]
    FileCreateFailed {
        /// Directory the file was requested in.
        dir: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The backing file is locked by someone else.
    #[error("failed to lock backing file {path}: {source}")]
    LockFailed {
        /// Path of the backing file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Resizing the backing file failed.
    #[error("failed to resize backing file {path}: {source}")]
    TruncateFailed {
        /// Path of the backing file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// `capacity * stride` does not fit in the address space.
    #[error("capacity overflow: {capacity} elements of {stride} bytes")]
    CapacityOverflow {
        /// Requested capacity in elements.
        capacity: usize,
        /// Element size in bytes.
        stride: usize,
    },

    /// An `madvise` call failed.
    #[error("advice failed: {0}")]
    AdviceFailed(String),

    /// Wrapper for `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Coarse classification callers can branch on to degrade gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Address space or memory is exhausted.
    OutOfMemory,
    /// A filesystem or mapping call failed.
    Io,
    /// The backing file is held by another owner.
    ResourceBusy,
}

impl MmapBufferError {
    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::OutOfMemory { .. } | Self::CapacityOverflow { .. } => ErrorClass::OutOfMemory,
            Self::LockFailed { .. } => ErrorClass::ResourceBusy,
            Self::MapFailed(e) | Self::Io(e) if e.raw_os_error() == Some(libc::ENOMEM) => {
                ErrorClass::OutOfMemory
            }
            Self::MapFailed(_)
            | Self::FileCreateFailed { .. }
            | Self::TruncateFailed { .. }
            | Self::AdviceFailed(_)
            | Self::Io(_) => ErrorClass::Io,
        }
    }

    /// Turn a failed mapping call into the matching variant.
    pub(crate) fn from_map_error(err: io::Error, bytes: usize) -> Self {
        if err.raw_os_error() == Some(libc::ENOMEM) || err.kind() == io::ErrorKind::OutOfMemory {
            Self::OutOfMemory { bytes }
        } else {
            Self::MapFailed(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert_eq!(
            MmapBufferError::OutOfMemory { bytes: 4096 }.class(),
            ErrorClass::OutOfMemory
        );
        assert_eq!(
            MmapBufferError::LockFailed {
                path: PathBuf::from("/tmp/x"),
                source: io::Error::from(io::ErrorKind::WouldBlock),
            }
            .class(),
            ErrorClass::ResourceBusy
        );
        assert_eq!(
            MmapBufferError::MapFailed(io::Error::from(io::ErrorKind::InvalidInput)).class(),
            ErrorClass::Io
        );
    }

    #[test]
    fn enomem_becomes_out_of_memory() {
        let err = MmapBufferError::from_map_error(io::Error::from_raw_os_error(libc::ENOMEM), 64);
        assert!(matches!(err, MmapBufferError::OutOfMemory { bytes: 64 }));
    }
}
