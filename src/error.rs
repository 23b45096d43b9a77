//! The error type shared by every stage of the pipeline.
//!
//! Only structural failures end up here. Record streams that are missing or
//! have the wrong shape are not errors: they decode to empty values.
use std::io;

use thiserror::Error;

use crate::model::Architecture;

/// Everything that can abort an analysis, a serialization or a read-back.
#[derive(Debug, Error)]
pub enum Error {
    /// Opening, mapping, reading or writing a file failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read asked for bytes past the end of the file.
    #[error("range {offset:#x}+{len:#x} is out of bounds (file size {file_size:#x})")]
    OutOfRange {
        offset: u64,
        len: u64,
        file_size: u64,
    },

    /// The file doesn't start with the `MDMP` signature.
    #[error("header signature {0:#x} is unexpected")]
    InvalidSignature(u32),

    /// More than one directory entry declares the same stream type.
    #[error("the directory declares stream type {0} more than once")]
    AmbiguousStream(u32),

    /// The pointer width of the architecture is unknown, so addresses can't be
    /// masked.
    #[error("unsupported architecture {0}")]
    UnsupportedArchitecture(Architecture),

    /// The container was written by an incompatible version.
    #[error("unsupported container format version {0}")]
    UnsupportedFormatVersion(u32),

    /// A container section is missing, truncated or has trailing data.
    #[error("malformed {section} section: {message}")]
    MalformedSection {
        section: &'static str,
        message: String,
    },
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
