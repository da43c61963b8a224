//! Resumable import of mbox files and Apple Mail trees.

pub mod checkpoint;
mod emlx_source;
mod mbox_source;
pub mod normalizer;
mod orchestrator;
pub mod summary;

pub use checkpoint::{EmlxCursor, MboxCursor};
pub use normalizer::{MessageNormalizer, Normalized, RawInput};
pub use summary::ImportSummary;

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::config::{DEFAULT_MAX_MESSAGE_BYTES, ImportConfig};
use crate::error::ImportError;
use crate::mime::{MailParser, MimeParser};
use crate::store::Store;

use emlx_source::EmlxSource;
use mbox_source::MboxSource;
use orchestrator::{or_default, run_import};

/// Per-invocation import settings.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Source type recorded on the source row; `mbox` or `apple-mail` when unset.
    pub source_type: Option<String>,
    /// Account address; also decides which messages were sent by the owner.
    pub identifier: String,
    /// Label applied to every imported message.
    pub label: Option<String>,
    /// Start a new run even if one is still running for the source.
    pub no_resume: bool,
    pub checkpoint_interval: usize,
    pub batch_messages: usize,
    pub batch_bytes: u64,
    /// Attachment root; empty disables writing attachments.
    pub attachments_dir: PathBuf,
    /// Per-message size limit in bytes; zero selects the 128 MiB default.
    pub max_message_bytes: u64,
    pub unescape_from: bool,
}

impl ImportOptions {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self::from_config(identifier, &ImportConfig::from_env())
    }

    pub fn from_config(identifier: impl Into<String>, config: &ImportConfig) -> Self {
        Self {
            source_type: None,
            identifier: identifier.into(),
            label: None,
            no_resume: false,
            checkpoint_interval: config.checkpoint_interval,
            batch_messages: config.batch_messages,
            batch_bytes: config.batch_bytes,
            attachments_dir: config.attachments_dir.clone(),
            max_message_bytes: config.max_message_bytes,
            unescape_from: config.unescape_from,
        }
    }

    /// Per-message size limit; zero means the default.
    fn message_limit(&self) -> u64 {
        or_default(self.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES)
    }
}

/// Import one mbox file.
pub async fn import_mbox(
    store: &dyn Store,
    path: &Path,
    options: &ImportOptions,
    cancel: &CancellationToken,
) -> Result<ImportSummary, ImportError> {
    import_mbox_with_parser(store, &MailParser::new(), path, options, cancel).await
}

pub async fn import_mbox_with_parser(
    store: &dyn Store,
    parser: &dyn MimeParser,
    path: &Path,
    options: &ImportOptions,
    cancel: &CancellationToken,
) -> Result<ImportSummary, ImportError> {
    let source = MboxSource::new(path, options.message_limit(), options.unescape_from)?;
    run_import(store, parser, cancel, options, source).await
}

/// Import every mailbox under an Apple Mail directory.
pub async fn import_emlx(
    store: &dyn Store,
    root: &Path,
    options: &ImportOptions,
    cancel: &CancellationToken,
) -> Result<ImportSummary, ImportError> {
    import_emlx_with_parser(store, &MailParser::new(), root, options, cancel).await
}

pub async fn import_emlx_with_parser(
    store: &dyn Store,
    parser: &dyn MimeParser,
    root: &Path,
    options: &ImportOptions,
    cancel: &CancellationToken,
) -> Result<ImportSummary, ImportError> {
    let source = EmlxSource::new(root, options.message_limit())?;
    run_import(store, parser, cancel, options, source).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_message_limit_means_default() {
        let mut options = ImportOptions::from_config("me@example.com", &ImportConfig::default());
        options.max_message_bytes = 0;
        assert_eq!(options.message_limit(), DEFAULT_MAX_MESSAGE_BYTES);

        options.max_message_bytes = 4096;
        assert_eq!(options.message_limit(), 4096);
    }
}
