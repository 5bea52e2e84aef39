//! Error types for page resolution, extraction and decoding.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures of a single member extraction.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to launch archive tool {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while extracting: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive tool exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("archive is encrypted or password-protected")]
    EncryptedArchive,

    #[error("member exceeds the memory limit ({0} bytes read)")]
    MemoryLimitExceeded(u64),

    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("archive tool produced no data for the member")]
    EmptyMember,

    #[error("extraction cancelled")]
    Cancelled,
}

impl ExtractError {
    /// Returns `true` if a disk-mode extraction may succeed where the
    /// memory-mode one failed.
    pub fn allows_disk_fallback(&self) -> bool {
        matches!(
            self,
            Self::MemoryLimitExceeded(_) | Self::Timeout(_) | Self::NonZeroExit { .. } | Self::Io(_)
        )
    }
}

/// Failures of an archive listing.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("failed to launch archive tool {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while listing: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive listing failed with exit code {0}")]
    ListingFailed(i32),

    #[error("archive listing is not valid text")]
    InvalidArchive,
}

/// The decoder rejected the bytes it was given.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error while decoding: {0}")]
    Io(#[from] std::io::Error),

    #[error("decoder task failed: {0}")]
    Task(String),
}

/// Errors surfaced by the pager core.
#[derive(Error, Debug)]
pub enum PagerError {
    #[error("no images found in {}", .0.display())]
    NoImagesFound(PathBuf),

    #[error("page index {index} is out of range (total {total})")]
    IndexOutOfRange { index: usize, total: usize },

    #[error("unsupported format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("access denied: {}", .0.display())]
    AccessDenied(PathBuf),

    #[error("archive tool not available: {0}")]
    ToolUnavailable(String),

    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("archive listing failed: {0}")]
    Listing(#[from] IndexError),

    #[error("decode failed: {0}")]
    DecodeFailed(#[from] DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no content loaded")]
    NoContent,
}

impl PagerError {
    /// Returns `true` if the error only concerns one page; the content
    /// source stays usable and the reader may navigate past it.
    pub fn is_page_local(&self) -> bool {
        matches!(
            self,
            Self::Extraction(_) | Self::DecodeFailed(_) | Self::IndexOutOfRange { .. } | Self::Io(_)
        )
    }

    pub(crate) fn from_io(err: std::io::Error, path: PathBuf) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path),
            std::io::ErrorKind::PermissionDenied => Self::AccessDenied(path),
            _ => Self::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, PagerError>;
