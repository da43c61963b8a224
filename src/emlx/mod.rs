//! Apple Mail `.emlx` support: mailbox discovery and single-file parsing.

pub mod discover;
pub mod reader;

pub use discover::{Mailbox, discover_mailboxes, label_from_path};
pub use reader::{EmlxMessage, EmlxMetadata, parse_emlx, read_emlx_file};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmlxError {
    #[error("emlx: empty file")]
    Empty,
    #[error("emlx: no newline after byte count")]
    MissingByteCount,
    #[error("emlx: invalid byte count {0:?}")]
    InvalidByteCount(String),
    #[error("emlx: negative byte count {0}")]
    NegativeByteCount(i64),
    #[error("emlx: byte count {count} exceeds file size (available: {available})")]
    ByteCountExceedsFile { count: u64, available: u64 },
    #[error("emlx: {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("emlx: read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
