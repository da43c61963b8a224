use std::fs::{self, File};
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::ImportError;
use crate::mbox::reader::VALIDATE_PREFIX_BYTES;
use crate::mbox::{MboxError, MboxReader, parse_separator_date_strict, validate};

use super::checkpoint::MboxCursor;
use super::orchestrator::{Candidate, MessageSource, SourceEvent};
use super::summary::ImportSummary;

/// Messages of one mbox file, in file order.
pub(crate) struct MboxSource {
    path: PathBuf,
    /// Symlink-resolved path recorded in checkpoints.
    resolved: PathBuf,
    max_message_bytes: u64,
    unescape_from: bool,
    reader: Option<MboxReader<BufReader<File>>>,
    seq: u64,
}

impl MboxSource {
    pub(crate) fn new(
        path: &Path,
        max_message_bytes: u64,
        unescape_from: bool,
    ) -> Result<Self, ImportError> {
        let path = std::path::absolute(path).map_err(|err| ImportError::io(path, err))?;
        let resolved = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        Ok(Self {
            path,
            resolved,
            max_message_bytes,
            unescape_from,
            reader: None,
            seq: 0,
        })
    }

    fn cursor(&self, offset: u64) -> MboxCursor {
        MboxCursor {
            file: self.resolved.to_string_lossy().into_owned(),
            offset,
            seq: self.seq,
        }
    }

    fn same_file(&self, other: &str) -> bool {
        let other = Path::new(other);
        if other == self.path || other == self.resolved {
            return true;
        }
        fs::canonicalize(other).is_ok_and(|resolved| resolved == self.resolved)
    }
}

impl MessageSource for MboxSource {
    type Cursor = MboxCursor;

    const SYNC_TYPE: &'static str = "import-mbox";
    const DEFAULT_SOURCE_TYPE: &'static str = "mbox";

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn initial_cursor(&self) -> MboxCursor {
        MboxCursor {
            file: self.resolved.to_string_lossy().into_owned(),
            offset: 0,
            seq: 0,
        }
    }

    fn accept_cursor(&self, cursor: MboxCursor) -> Result<MboxCursor, ImportError> {
        if cursor.file.is_empty() {
            return Ok(self.initial_cursor());
        }
        if !self.same_file(&cursor.file) {
            return Err(ImportError::SourceMismatch {
                checkpoint: cursor.file,
                requested: self.path.display().to_string(),
            });
        }
        Ok(MboxCursor {
            file: self.resolved.to_string_lossy().into_owned(),
            ..cursor
        })
    }

    fn open(&mut self, from: &MboxCursor, fresh: bool) -> Result<(), ImportError> {
        let mut file = File::open(&self.path).map_err(|err| ImportError::io(&self.path, err))?;
        let size = file
            .metadata()
            .map_err(|err| ImportError::io(&self.path, err))?
            .len();

        if from.offset > size {
            return Err(ImportError::OffsetBeyondEof {
                offset: from.offset,
                size,
            });
        }
        if from.offset > 0 && from.offset == size {
            log::info!(
                "resume offset at end of {}; no work to do",
                self.path.display()
            );
        }

        if from.offset == 0 && fresh {
            validate(&mut file, VALIDATE_PREFIX_BYTES).map_err(|source| ImportError::NotMbox {
                path: self.path.clone(),
                source,
            })?;
        }
        file.seek(SeekFrom::Start(from.offset))
            .map_err(|err| ImportError::io(&self.path, err))?;

        self.seq = from.seq;
        self.reader = Some(
            MboxReader::with_start_offset(BufReader::new(file), from.offset)
                .with_max_message_bytes(self.max_message_bytes)
                .with_unescape_from(self.unescape_from),
        );
        Ok(())
    }

    fn next_event(&mut self) -> Option<SourceEvent<MboxCursor>> {
        let reader = self.reader.as_mut()?;
        match reader.next_message() {
            Ok(Some(message)) => {
                let next_offset = reader.next_boundary_offset();
                self.seq += 1;
                Some(SourceEvent::Message(Candidate {
                    fallback_date: parse_separator_date_strict(&message.separator),
                    raw: message.raw,
                    label: None,
                    position: self.cursor(next_offset),
                }))
            }
            Ok(None) => None,
            Err(MboxError::Io(err)) => Some(SourceEvent::Aborted {
                reason: format!("read error at offset {}: {}", reader.offset(), err),
            }),
            Err(err) => {
                let next_offset = reader.next_boundary_offset();
                Some(SourceEvent::Unreadable {
                    reason: format!("{} (next message at offset {})", err, next_offset),
                    resume_at: self.cursor(next_offset),
                })
            }
        }
    }

    fn dedup_key(&self, raw_hash: &str, position: &MboxCursor) -> String {
        format!("mbox-{}-{}", raw_hash, position.seq)
    }

    fn drained_cursor(&self, _last: &MboxCursor) -> Option<MboxCursor> {
        let reader = self.reader.as_ref()?;
        Some(self.cursor(reader.offset()))
    }

    fn completion_cursor(&self, _summary: &ImportSummary) -> String {
        let offset = self.reader.as_ref().map(|r| r.offset()).unwrap_or(0);
        format!("offset:{}", offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TWO: &str = "From a@x Mon Jan 1 00:00:00 2024\nSubject: one\n\nbody\nFrom b@x Tue Jan 2 00:00:00 +0000 2024\nSubject: two\n\nbody\n";

    fn mbox_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("tempfile");
        file.write_all(content.as_bytes()).expect("write");
        file
    }

    fn collect(source: &mut MboxSource) -> Vec<SourceEvent<MboxCursor>> {
        std::iter::from_fn(|| source.next_event()).collect()
    }

    #[test]
    fn sequence_numbers_follow_file_order() {
        let file = mbox_file(TWO);
        let mut source = MboxSource::new(file.path(), 0, true).expect("source");
        let start = source.initial_cursor();
        source.open(&start, true).expect("open");

        let events = collect(&mut source);
        assert_eq!(events.len(), 2);
        let SourceEvent::Message(second) = &events[1] else {
            panic!("expected message");
        };
        assert_eq!(second.position.seq, 2);
        assert_eq!(second.position.offset, TWO.len() as u64);
        assert_eq!(source.dedup_key("abc", &second.position), "mbox-abc-2");
        assert!(second.fallback_date.is_some());
    }

    #[test]
    fn resume_seeks_and_continues_sequence() {
        let file = mbox_file(TWO);
        let mut source = MboxSource::new(file.path(), 0, true).expect("source");
        let second_offset = TWO.find("From b@x").expect("offset") as u64;
        let cursor = source
            .accept_cursor(MboxCursor {
                file: file.path().to_string_lossy().into_owned(),
                offset: second_offset,
                seq: 1,
            })
            .expect("same file");
        source.open(&cursor, false).expect("open");

        let events = collect(&mut source);
        assert_eq!(events.len(), 1);
        let SourceEvent::Message(message) = &events[0] else {
            panic!("expected message");
        };
        assert_eq!(message.position.seq, 2);
        assert!(String::from_utf8_lossy(&message.raw).contains("Subject: two"));
    }

    #[test]
    fn rejects_cursor_for_other_file() {
        let file = mbox_file(TWO);
        let other = mbox_file(TWO);
        let source = MboxSource::new(file.path(), 0, true).expect("source");
        let err = source
            .accept_cursor(MboxCursor {
                file: other.path().to_string_lossy().into_owned(),
                offset: 10,
                seq: 1,
            })
            .expect_err("mismatch");
        assert!(matches!(err, ImportError::SourceMismatch { .. }));
    }

    #[test]
    fn offset_beyond_end_is_structural() {
        let file = mbox_file(TWO);
        let mut source = MboxSource::new(file.path(), 0, true).expect("source");
        let mut cursor = source.initial_cursor();
        cursor.offset = 10_000;
        let err = source.open(&cursor, false).expect_err("beyond eof");
        assert!(matches!(err, ImportError::OffsetBeyondEof { .. }));
    }

    #[test]
    fn fresh_open_rejects_non_mbox() {
        let file = mbox_file("just some text\nwithout separators\n");
        let mut source = MboxSource::new(file.path(), 0, true).expect("source");
        let start = source.initial_cursor();
        let err = source.open(&start, true).expect_err("not mbox");
        assert!(matches!(err, ImportError::NotMbox { .. }));
    }

    #[test]
    fn oversized_message_is_unreadable_and_reading_continues() {
        let big = format!(
            "From a@x Mon Jan 1 00:00:00 2024\nSubject: big\n\n{}\nFrom b@x Tue Jan 2 00:00:00 2024\nSubject: small\n\nok\n",
            "y".repeat(4096)
        );
        let file = mbox_file(&big);
        let mut source = MboxSource::new(file.path(), 1024, true).expect("source");
        let start = source.initial_cursor();
        source.open(&start, true).expect("open");

        let events = collect(&mut source);
        assert_eq!(events.len(), 2);
        let SourceEvent::Unreadable { resume_at, .. } = &events[0] else {
            panic!("expected unreadable");
        };
        assert_eq!(resume_at.seq, 0);
        assert_eq!(resume_at.offset, big.find("From b@x").expect("offset") as u64);
        let SourceEvent::Message(small) = &events[1] else {
            panic!("expected message");
        };
        assert_eq!(small.position.seq, 1);
    }
}
