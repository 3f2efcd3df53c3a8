//! Error types for a flashing run

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::transfer::TransferError;

/// Failure while turning an [ImageRequest](crate::ImageRequest) into a
/// local, decompressed image
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("Failed to download system image from {url}: {reason}")]
    Http { url: String, reason: String },

    #[error("Failed to download system image from {url}: HTTP status {status}")]
    Status { url: String, status: u16 },

    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to extract image from archive: {0}")]
    Decompress(#[from] DecompressError),

    #[error("Download cancelled")]
    Cancelled,
}

impl AcquireError {
    pub(crate) fn io(
        action: &'static str,
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| AcquireError::Io {
            action,
            path,
            source,
        }
    }
}

/// XZ stream decoding failure
#[derive(Debug, Error)]
pub enum DecompressError {
    #[error("Memory error")]
    Memory,
    #[error("Invalid format")]
    Format,
    #[error("Corrupt data")]
    Corrupt,
    #[error("Unexpected end of compressed input")]
    Truncated,
    #[error("Decompression error: {0}")]
    Other(String),
}

impl From<xz2::stream::Error> for DecompressError {
    fn from(err: xz2::stream::Error) -> Self {
        use xz2::stream::Error;
        match err {
            Error::Mem | Error::MemLimit => DecompressError::Memory,
            Error::Format => DecompressError::Format,
            Error::Data => DecompressError::Corrupt,
            other => DecompressError::Other(other.to_string()),
        }
    }
}

/// Terminal failure of a flashing run
#[derive(Debug, Error)]
pub enum FlashError {
    #[error(transparent)]
    Acquisition(#[from] AcquireError),

    #[error("Bootloader file not found: {}", .0.display())]
    StageFileMissing(PathBuf),

    #[error("Failed to initialize DFU for {stage}: {source}")]
    Init {
        stage: String,
        #[source]
        source: TransferError,
    },

    #[error("Failed to find DFU device for {stage} (alt: {alt})")]
    DeviceNotFound {
        stage: String,
        alt: String,
        #[source]
        source: TransferError,
    },

    #[error("Failed to download {stage}: {source}")]
    Transfer {
        stage: String,
        #[source]
        source: TransferError,
    },

    #[error("Run cancelled")]
    Cancelled,
}

pub type Result<T, E = FlashError> = std::result::Result<T, E>;
