//! Streaming reader for concatenated mbox files.
//!
//! The reader keeps exactly one line of lookahead: the separator that starts
//! the next message. Offsets are absolute byte positions in the underlying
//! file so that an import can persist them and later resume with a seek. A
//! resume offset that lands mid-line is harmless because scanning only moves
//! forward until the next separator.

use std::io::{BufRead, BufReader, Read};

use super::separator::is_separator_line;
use super::MboxError;

/// Longest single line accepted before the message is abandoned.
pub const MAX_LINE_BYTES: usize = 32 << 20;

/// Prefix inspected by [`validate`].
pub const VALIDATE_PREFIX_BYTES: u64 = 8 << 20;

/// One message read from an mbox stream.
#[derive(Debug, Clone)]
pub struct MboxMessage {
    /// Separator line without its trailing line ending.
    pub separator: String,
    /// Offset of the separator line.
    pub offset: u64,
    pub raw: Vec<u8>,
}

#[derive(Debug)]
struct PendingBoundary {
    line: String,
    offset: u64,
}

pub struct MboxReader<R> {
    inner: R,
    offset: u64,
    pending: Option<PendingBoundary>,
    eof: bool,
    max_message_bytes: u64,
    unescape_from: bool,
}

impl<R: BufRead> MboxReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_start_offset(inner, 0)
    }

    /// Wrap a stream already positioned at `offset`.
    pub fn with_start_offset(inner: R, offset: u64) -> Self {
        Self {
            inner,
            offset,
            pending: None,
            eof: false,
            max_message_bytes: 0,
            unescape_from: true,
        }
    }

    /// Limit the size of a single message; zero disables the limit.
    pub fn with_max_message_bytes(mut self, limit: u64) -> Self {
        self.max_message_bytes = limit;
        self
    }

    pub fn with_unescape_from(mut self, enabled: bool) -> Self {
        self.unescape_from = enabled;
        self
    }

    /// Offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset at which reading should resume to get the next message.
    pub fn next_boundary_offset(&self) -> u64 {
        self.pending
            .as_ref()
            .map(|boundary| boundary.offset)
            .unwrap_or(self.offset)
    }

    fn read_line(&mut self, buf: &mut Vec<u8>) -> Result<usize, MboxError> {
        buf.clear();
        let read = (&mut self.inner)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', buf)?;
        self.offset += read as u64;
        if read > MAX_LINE_BYTES {
            return Err(MboxError::LineTooLong {
                limit: MAX_LINE_BYTES,
            });
        }
        Ok(read)
    }

    /// Read the next message, or `Ok(None)` once the stream is exhausted.
    ///
    /// A message over the size limit is consumed in full so the following
    /// separator is still found, then reported as
    /// [`MboxError::MessageTooLarge`].
    pub fn next_message(&mut self) -> Result<Option<MboxMessage>, MboxError> {
        if self.eof {
            return Ok(None);
        }

        let mut line = Vec::new();
        if self.pending.is_none() {
            loop {
                let start = self.offset;
                if self.read_line(&mut line)? == 0 {
                    self.eof = true;
                    return Ok(None);
                }
                if is_separator_bytes(&line) {
                    self.pending = Some(PendingBoundary {
                        line: boundary_text(&line),
                        offset: start,
                    });
                    break;
                }
            }
        }

        let Some(boundary) = self.pending.take() else {
            return Ok(None);
        };

        let mut raw = Vec::new();
        let mut too_large = false;
        loop {
            let start = self.offset;
            if self.read_line(&mut line)? == 0 {
                self.eof = true;
                break;
            }
            if is_separator_bytes(&line) {
                self.pending = Some(PendingBoundary {
                    line: boundary_text(&line),
                    offset: start,
                });
                break;
            }
            if too_large {
                continue;
            }

            let bytes = if self.unescape_from {
                unescape_from_line(&line)
            } else {
                &line[..]
            };
            if self.max_message_bytes > 0
                && (raw.len() + bytes.len()) as u64 > self.max_message_bytes
            {
                too_large = true;
                raw = Vec::new();
            } else {
                raw.extend_from_slice(bytes);
            }
        }

        if too_large {
            return Err(MboxError::MessageTooLarge {
                limit: self.max_message_bytes,
            });
        }

        Ok(Some(MboxMessage {
            separator: boundary.line,
            offset: boundary.offset,
            raw,
        }))
    }
}

impl<R: BufRead> Iterator for MboxReader<R> {
    type Item = Result<MboxMessage, MboxError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_message().transpose()
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn boundary_text(line: &[u8]) -> String {
    String::from_utf8_lossy(trim_line_end(line)).into_owned()
}

fn is_separator_bytes(line: &[u8]) -> bool {
    line.starts_with(b"From ") && is_separator_line(&boundary_text(line))
}

/// Strip one `>` from a `>From ` escaped body line (any depth of `>`).
pub fn unescape_from_line(line: &[u8]) -> &[u8] {
    let quotes = line.iter().take_while(|b| **b == b'>').count();
    if quotes > 0 && line[quotes..].starts_with(b"From ") {
        &line[1..]
    } else {
        line
    }
}

/// Fail fast when no separator appears within the first `max_bytes`.
pub fn validate<R: Read>(reader: R, max_bytes: u64) -> Result<(), MboxError> {
    let mut limited = BufReader::new(reader.take(max_bytes));
    let mut line = Vec::new();
    loop {
        line.clear();
        if limited.read_until(b'\n', &mut line)? == 0 {
            return Err(MboxError::NoSeparators);
        }
        if is_separator_bytes(&line) {
            return Ok(());
        }
    }
}
