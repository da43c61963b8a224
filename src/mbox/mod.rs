//! mbox parsing: separator detection and the streaming message reader.

pub mod reader;
pub mod separator;

pub use reader::{MboxMessage, MboxReader, validate};
pub use separator::{is_separator_line, parse_separator_date, parse_separator_date_strict};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MboxError {
    #[error("mbox message exceeds max size: limit {limit} bytes")]
    MessageTooLarge { limit: u64 },
    #[error("mbox line exceeds max length ({limit} bytes)")]
    LineTooLong { limit: usize },
    #[error("no \"From \" separators found (not an mbox file?)")]
    NoSeparators,
    #[error("i/o error reading mbox: {0}")]
    Io(#[from] std::io::Error),
}
