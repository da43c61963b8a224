use std::fs;
use std::path::{Path, PathBuf};

use crate::emlx::{Mailbox, discover_mailboxes, read_emlx_file};
use crate::error::ImportError;

use super::checkpoint::EmlxCursor;
use super::orchestrator::{Candidate, MessageSource, SourceEvent};
use super::summary::ImportSummary;

/// Messages of every mailbox under an Apple Mail root, mailbox by mailbox.
pub(crate) struct EmlxSource {
    root: PathBuf,
    mailboxes: Vec<Mailbox>,
    max_message_bytes: u64,
    mailbox_index: usize,
    file_index: usize,
    /// Files up to and including this name were handled before a resume.
    resume_after: Option<(usize, String)>,
    announced: bool,
}

impl EmlxSource {
    pub(crate) fn new(root: &Path, max_message_bytes: u64) -> Result<Self, ImportError> {
        let mailboxes = discover_mailboxes(root)?;
        let root = std::path::absolute(root).map_err(|err| ImportError::io(root, err))?;
        if mailboxes.is_empty() {
            return Err(ImportError::NoMailboxes { path: root });
        }
        Ok(Self {
            root,
            mailboxes,
            max_message_bytes,
            mailbox_index: 0,
            file_index: 0,
            resume_after: None,
            announced: false,
        })
    }

    fn root_string(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn cursor(&self, mailbox_index: usize, last_file: &str) -> EmlxCursor {
        EmlxCursor {
            root_dir: self.root_string(),
            mailbox_index,
            mailbox_path: self.mailboxes[mailbox_index]
                .path
                .to_string_lossy()
                .into_owned(),
            last_file: last_file.to_string(),
        }
    }

    fn next_mailbox(&mut self) {
        self.mailbox_index += 1;
        self.file_index = 0;
        self.announced = false;
    }

    fn already_handled(&self, name: &str) -> bool {
        self.resume_after
            .as_ref()
            .is_some_and(|(index, last)| *index == self.mailbox_index && name <= last.as_str())
    }
}

impl MessageSource for EmlxSource {
    type Cursor = EmlxCursor;

    const SYNC_TYPE: &'static str = "import-emlx";
    const DEFAULT_SOURCE_TYPE: &'static str = "apple-mail";

    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn initial_cursor(&self) -> EmlxCursor {
        self.cursor(0, "")
    }

    fn accept_cursor(&self, cursor: EmlxCursor) -> Result<EmlxCursor, ImportError> {
        if cursor.root_dir != self.root_string() {
            return Err(ImportError::SourceMismatch {
                checkpoint: cursor.root_dir,
                requested: self.root_string(),
            });
        }
        let total = self.mailboxes.len();
        if cursor.mailbox_index >= total {
            return Err(ImportError::MailboxIndexOutOfRange {
                index: cursor.mailbox_index,
                total,
            });
        }
        let actual = self.mailboxes[cursor.mailbox_index]
            .path
            .to_string_lossy()
            .into_owned();
        if !cursor.mailbox_path.is_empty() && cursor.mailbox_path != actual {
            return Err(ImportError::MailboxChanged {
                index: cursor.mailbox_index,
                expected: cursor.mailbox_path,
                actual,
            });
        }
        Ok(EmlxCursor {
            mailbox_path: actual,
            ..cursor
        })
    }

    fn open(&mut self, from: &EmlxCursor, _fresh: bool) -> Result<(), ImportError> {
        self.mailbox_index = from.mailbox_index;
        self.file_index = 0;
        self.announced = false;
        self.resume_after = if from.last_file.is_empty() {
            None
        } else {
            Some((from.mailbox_index, from.last_file.clone()))
        };
        Ok(())
    }

    fn next_event(&mut self) -> Option<SourceEvent<EmlxCursor>> {
        loop {
            let mailbox = self.mailboxes.get(self.mailbox_index)?;
            if !self.announced {
                self.announced = true;
                log::info!(
                    "importing mailbox {} ({} files, index {})",
                    mailbox.label,
                    mailbox.files.len(),
                    self.mailbox_index
                );
            }

            let Some(name) = mailbox.files.get(self.file_index).cloned() else {
                self.next_mailbox();
                return Some(SourceEvent::GroupEnd);
            };
            self.file_index += 1;
            if self.already_handled(&name) {
                continue;
            }

            let path = mailbox.file_path(&name);
            let label = mailbox.label.clone();
            let position = self.cursor(self.mailbox_index, &name);

            let size = match fs::metadata(&path) {
                Ok(metadata) => metadata.len(),
                Err(err) => {
                    return Some(SourceEvent::Unreadable {
                        reason: format!("failed to stat {}: {}", path.display(), err),
                        resume_at: position,
                    });
                }
            };
            if size > self.max_message_bytes {
                return Some(SourceEvent::Unreadable {
                    reason: format!(
                        "{} exceeds size limit ({} > {} bytes)",
                        path.display(),
                        size,
                        self.max_message_bytes
                    ),
                    resume_at: position,
                });
            }

            return Some(match read_emlx_file(&path) {
                Ok(message) => SourceEvent::Message(Candidate {
                    raw: message.raw,
                    fallback_date: message.metadata.date_sent,
                    label: Some(label),
                    position,
                }),
                Err(err) => SourceEvent::Unreadable {
                    reason: format!("failed to parse {}: {}", path.display(), err),
                    resume_at: position,
                },
            });
        }
    }

    fn dedup_key(&self, raw_hash: &str, _position: &EmlxCursor) -> String {
        format!("emlx-{}", raw_hash)
    }

    fn skip_group(&mut self) {
        if self.mailbox_index < self.mailboxes.len() {
            log::warn!(
                "skipping mailbox {}",
                self.mailboxes[self.mailbox_index].path.display()
            );
            self.next_mailbox();
        }
    }

    fn group_total(&self) -> usize {
        self.mailboxes.len()
    }

    fn completion_cursor(&self, summary: &ImportSummary) -> String {
        format!(
            "mailboxes:{} messages:{}",
            summary.mailboxes_imported, summary.added
        )
    }
}
