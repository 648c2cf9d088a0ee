//! Storage selection for buffers.
//!
//! A buffer picks its storage once, at construction, and every region it
//! (or any copy-on-write clone of it) maps afterwards uses the same choice.

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default file name prefix for spill files.
pub const DEFAULT_PREFIX: &str = "mmbuf-";

/// Where file-backed regions put their temp files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillConfig {
    directory: PathBuf,
    prefix: String,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir(),
            prefix: DEFAULT_PREFIX.to_owned(),
        }
    }
}

impl SpillConfig {
    /// Config rooted at `directory` with the default prefix.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            prefix: DEFAULT_PREFIX.to_owned(),
        }
    }

    /// Replace the directory.
    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Replace the file name prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Directory that receives the backing files. Must exist by the time
    /// the first file is created.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File name prefix; a random suffix is appended per file.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Backing store for a buffer's regions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageOption {
    /// Anonymous, process-private mapping.
    #[default]
    InMemory,
    /// Shared mapping of an exclusively locked temp file.
    FileBacked(Arc<SpillConfig>),
}

impl StorageOption {
    /// File-backed storage in the process temp directory.
    #[must_use]
    pub fn file_backed() -> Self {
        Self::FileBacked(Arc::new(SpillConfig::default()))
    }

    /// File-backed storage in `directory`.
    pub fn file_backed_in(directory: impl Into<PathBuf>) -> Self {
        Self::FileBacked(Arc::new(SpillConfig::new(directory)))
    }

    /// Whether regions spill to a file.
    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        matches!(self, Self::FileBacked(_))
    }
}

impl From<SpillConfig> for StorageOption {
    fn from(config: SpillConfig) -> Self {
        Self::FileBacked(Arc::new(config))
    }
}
