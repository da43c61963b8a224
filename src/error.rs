//! Error taxonomy shared by the import entry points.
//!
//! Only structural problems and store failures that prevent a run from being
//! started or finalized surface as [`ImportError`]. Per-message failures are
//! soft or hard outcomes recorded in the run summary instead.

use std::path::PathBuf;
use thiserror::Error;

use crate::emlx::EmlxError;
use crate::mbox::MboxError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("an identifier is required")]
    MissingIdentifier,
    #[error("{path} does not look like an mbox file: {source}")]
    NotMbox {
        path: PathBuf,
        #[source]
        source: MboxError,
    },
    #[error("{path} does not contain any emlx mailboxes")]
    NoMailboxes { path: PathBuf },
    #[error(
        "active import checkpoint belongs to {checkpoint}, not {requested}; rerun with --no-resume to start fresh"
    )]
    SourceMismatch { checkpoint: String, requested: String },
    #[error("checkpoint offset {offset} is beyond end of file ({size} bytes)")]
    OffsetBeyondEof { offset: u64, size: u64 },
    #[error("checkpoint mailbox index {index} out of range ({total} mailboxes)")]
    MailboxIndexOutOfRange { index: usize, total: usize },
    #[error("mailbox at index {index} changed from {expected} to {actual}; rerun with --no-resume")]
    MailboxChanged {
        index: usize,
        expected: String,
        actual: String,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Emlx(#[from] EmlxError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ImportError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ImportError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures detected before any message was committed.
    pub fn is_structural(&self) -> bool {
        !matches!(self, ImportError::Store(_))
    }
}
