use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SortError>;

/// Everything that can stop a sort. None of these are retried.
#[derive(Debug, Error)]
pub enum SortError {
    #[error("invalid configuration:\n{}", .0.join("\n"))]
    InvalidConfig(Vec<String>),

    #[error(
        "input file {} is missing or empty and there are no chunks to reuse; \
         generate one (`--generate`) or enable chunk reuse",
        .path.display()
    )]
    MissingInput { path: PathBuf },

    #[error("no chunk files found in {}; nothing to merge", .dir.display())]
    MissingChunks { dir: PathBuf },

    #[error(
        "not enough free space to write {} ({required} bytes needed, {available} available); \
         free some disk space or point the output elsewhere",
        .path.display()
    )]
    InsufficientDisk {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("malformed line {line:?}: {reason}")]
    Parse { line: String, reason: &'static str },

    #[error(
        "a line of at least {length} bytes does not fit in a {capacity} byte read buffer; \
         increase the base run size"
    )]
    LineTooLong { length: usize, capacity: usize },

    #[error("{0} worker panicked")]
    WorkerPanicked(&'static str),

    #[error("I/O operation failed: {0}")]
    Io(#[from] io::Error),
}
