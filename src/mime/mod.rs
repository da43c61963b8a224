//! MIME decoding seam.
//!
//! The import pipeline only depends on [`MimeParser`]; [`MailParser`] is the
//! `mailparse`-backed implementation used by the binary and the tests.

mod parser;

pub use parser::{MailParser, normalize_message_id};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::text::strip_html;

#[derive(Debug, Error)]
pub enum MimeError {
    #[error("failed to parse MIME structure: {0}")]
    Parse(#[from] mailparse::MailParseError),
}

/// A mailbox address; `email` is lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    pub name: String,
    pub email: String,
    pub domain: String,
}

impl Address {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        let email = email.into().trim().to_lowercase();
        let domain = email
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_string())
            .unwrap_or_default();
        Self {
            name: name.into(),
            email,
            domain,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content_id: Option<String>,
    pub content: Vec<u8>,
    /// Lowercase hex SHA-256 of `content`, when the parser computed one.
    pub content_hash: Option<String>,
    pub is_inline: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub subject: String,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub date: Option<DateTime<Utc>>,
    pub body_text: String,
    pub body_html: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<Attachment>,
}

impl ParsedMessage {
    /// Plain text body, falling back to text rendered from the HTML part.
    pub fn body_text(&self) -> String {
        if !self.body_text.is_empty() {
            self.body_text.clone()
        } else if !self.body_html.is_empty() {
            strip_html(&self.body_html)
        } else {
            String::new()
        }
    }

    pub fn first_from(&self) -> Option<&Address> {
        self.from.first()
    }
}

/// Decodes raw RFC 5322 bytes. Implementations must tolerate malformed input
/// as far as possible and only fail when nothing usable can be extracted.
pub trait MimeParser: Send + Sync {
    fn parse(&self, raw: &[u8]) -> Result<ParsedMessage, MimeError>;
}
