//! `mailparse`-backed MIME decoding.
//!
//! Extracts the headers the normalizer needs (subject, addresses, date and
//! the threading headers), the first `text/plain` and `text/html` bodies, and
//! every other leaf part as an attachment.
//!
//! # Body vs attachment
//!
//! A `text/plain` or `text/html` leaf without a filename and without an
//! explicit `Content-Disposition: attachment` is body content. Everything
//! else, including text parts that carry a filename, is an attachment.
//!
//! # Sanitization
//!
//! All text fields go through [`sanitize_text`] so that NUL bytes never reach
//! the store.

use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail, parse_mail};
use sha2::{Digest, Sha256};

use super::{Address, Attachment, MimeError, MimeParser, ParsedMessage};
use crate::text::sanitize_text;

#[derive(Debug, Clone, Copy, Default)]
pub struct MailParser;

impl MailParser {
    pub fn new() -> Self {
        Self
    }
}

impl MimeParser for MailParser {
    fn parse(&self, raw: &[u8]) -> Result<ParsedMessage, MimeError> {
        let parsed = parse_mail(raw).map_err(|e| {
            log::debug!("failed to parse MIME: {}", e);
            MimeError::Parse(e)
        })?;

        let header = |name: &str| parsed.headers.get_first_value(name);

        let mut message = ParsedMessage {
            subject: header("Subject")
                .map(|s| sanitize_text(&s))
                .unwrap_or_default(),
            from: addresses(&parsed, "From"),
            to: addresses(&parsed, "To"),
            cc: addresses(&parsed, "Cc"),
            bcc: addresses(&parsed, "Bcc"),
            date: header("Date").and_then(|d| parse_date(&d)),
            message_id: normalize_message_id(header("Message-ID")),
            in_reply_to: normalize_message_id(header("In-Reply-To")),
            references: header("References")
                .map(|v| extract_references(&v))
                .unwrap_or_default(),
            ..ParsedMessage::default()
        };

        collect_parts(&parsed, &mut message)?;
        message.body_text = sanitize_text(&message.body_text);
        message.body_html = sanitize_text(&message.body_html);

        log::trace!(
            "parsed {} ({} attachments)",
            message.message_id.as_deref().unwrap_or("<no message-id>"),
            message.attachments.len()
        );
        Ok(message)
    }
}

/// Clean and normalize message IDs by removing angle brackets and whitespace.
pub fn normalize_message_id(msg_id: Option<String>) -> Option<String> {
    msg_id.and_then(|id| {
        let cleaned = id.trim().trim_matches(&['<', '>'][..]).trim();
        if cleaned.is_empty() {
            None
        } else {
            Some(sanitize_text(cleaned))
        }
    })
}

/// Extract message IDs from a References header, split on whitespace.
fn extract_references(header_value: &str) -> Vec<String> {
    header_value
        .split_whitespace()
        .map(|id| sanitize_text(id.trim().trim_matches(&['<', '>'][..])))
        .filter(|id| !id.is_empty())
        .collect()
}

fn push_single(out: &mut Vec<Address>, info: &mailparse::SingleInfo) {
    if info.addr.trim().is_empty() {
        return;
    }
    let name = info.display_name.clone().unwrap_or_default();
    out.push(Address::new(sanitize_text(&name), info.addr.clone()));
}

/// Parse every address in every occurrence of `header_name`.
fn addresses(parsed: &ParsedMail<'_>, header_name: &str) -> Vec<Address> {
    let mut out = Vec::new();
    for value in parsed.headers.get_all_values(header_name) {
        let Ok(list) = mailparse::addrparse(&value) else {
            log::debug!("unparseable {} header: {}", header_name, value);
            continue;
        };
        for addr in list.iter() {
            match addr {
                mailparse::MailAddr::Single(info) => push_single(&mut out, info),
                mailparse::MailAddr::Group(group) => {
                    for info in &group.addrs {
                        push_single(&mut out, info);
                    }
                }
            }
        }
    }
    out
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = mailparse::dateparse(raw) {
        return DateTime::from_timestamp(seconds, 0);
    }
    match dateparser::parse(raw) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(err) => {
            log::debug!("invalid date `{}`: {}", raw, err);
            None
        }
    }
}

fn is_body_part(mimetype: &str, filename: Option<&str>, disposition: &DispositionType) -> bool {
    (mimetype == "text/plain" || mimetype == "text/html")
        && filename.is_none()
        && *disposition != DispositionType::Attachment
}

fn collect_parts(part: &ParsedMail<'_>, message: &mut ParsedMessage) -> Result<(), MimeError> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, message)?;
        }
        return Ok(());
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .map(|name| sanitize_text(name))
        .filter(|name| !name.is_empty());
    let mimetype = part.ctype.mimetype.to_ascii_lowercase();

    if is_body_part(&mimetype, filename.as_deref(), &disposition.disposition) {
        let body = part.get_body()?;
        let slot = if mimetype == "text/plain" {
            &mut message.body_text
        } else {
            &mut message.body_html
        };
        if slot.is_empty() {
            *slot = body;
        }
        return Ok(());
    }

    let content = part.get_body_raw()?;
    let hash = format!("{:x}", Sha256::digest(&content));
    message.attachments.push(Attachment {
        filename: filename.unwrap_or_default(),
        content_type: mimetype,
        content_id: normalize_message_id(part.headers.get_first_value("Content-ID")),
        content,
        content_hash: Some(hash),
        is_inline: disposition.disposition == DispositionType::Inline,
    });
    Ok(())
}
