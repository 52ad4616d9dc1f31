use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A key, value, or symbol component is outside the configured bounds.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Option symbol text is malformed.
    #[error("parse error: {0}")]
    Parse(String),
    /// Inserting a new key would push the segment beyond its maximum load.
    #[error("segment {segment} is full")]
    CapacityExceeded { segment: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The store file failed validation and cannot be repaired.
    #[error("corrupt store: {0}")]
    Corrupt(String),
    /// Another handle holds the exclusive lock on the store file.
    #[error("store already open: {}", .0.display())]
    AlreadyOpen(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;
