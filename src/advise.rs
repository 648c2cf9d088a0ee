//! Memory advise operations for optimizing OS behavior.

use bytemuck::Pod;

use crate::buffer::MmapBuffer;
#[cfg(feature = "advise")]
use crate::errors::{MmapBufferError, Result};

/// Memory access pattern advice for the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapAdvice {
    /// Normal access pattern (default).
    Normal,
    /// Random access pattern.
    Random,
    /// Sequential access pattern.
    Sequential,
    /// Will need this range soon.
    WillNeed,
    /// Won't need this range soon. Pages of file-backed buffers are written
    /// back and reloaded on demand; on in-memory buffers this is ignored,
    /// because the kernel would discard their contents.
    DontNeed,
}

impl<T: Pod> MmapBuffer<T> {
    /// Advise the OS about the expected access pattern for this buffer's
    /// mapping.
    ///
    /// The advice is a hint and may be ignored by the OS. Buffers that have
    /// not mapped anything yet return immediately.
    ///
    /// # Platform-specific behavior
    ///
    /// - **Unix**: Uses `madvise`
    /// - **Other**: no-op
    ///
    /// # Errors
    ///
    /// Returns `MmapBufferError::AdviceFailed` if the system call fails.
    #[cfg(feature = "advise")]
    pub fn advise(&self, advice: MmapAdvice) -> Result<()> {
        let Some((addr, len)) = self.region.mapped_span() else {
            return Ok(());
        };
        if advice == MmapAdvice::DontNeed && !self.storage().is_file_backed() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use libc::{madvise, MADV_DONTNEED, MADV_NORMAL, MADV_RANDOM, MADV_SEQUENTIAL, MADV_WILLNEED};

            let advice_flag = match advice {
                MmapAdvice::Normal => MADV_NORMAL,
                MmapAdvice::Random => MADV_RANDOM,
                MmapAdvice::Sequential => MADV_SEQUENTIAL,
                MmapAdvice::WillNeed => MADV_WILLNEED,
                MmapAdvice::DontNeed => MADV_DONTNEED,
            };

            // SAFETY: `addr..addr+len` is the region's whole page-aligned
            // mapping, kept alive by `&self`.
            let result = unsafe { madvise(addr.cast::<libc::c_void>(), len, advice_flag) };

            if result != 0 {
                let err = std::io::Error::last_os_error();
                return Err(MmapBufferError::AdviceFailed(format!(
                    "madvise failed: {err}"
                )));
            }
        }

        #[cfg(not(unix))]
        {
            let _ = (addr, len);
        }

        Ok(())
    }
}
