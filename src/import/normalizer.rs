//! Turns raw MIME into store records.
//!
//! The message row, bodies, raw bytes, recipients and labels are committed in
//! one `persist_message` call. Attachments are written afterwards; a failure
//! there leaves the message committed with its attachments pending so a
//! later run re-attempts only what is missing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::attachments::AttachmentContentStore;
use crate::mime::{Address, MimeParser, ParsedMessage, normalize_message_id};
use crate::store::{
    AttachmentRecord, MessageRecord, Recipient, RecipientKind, Store, StoreError,
};
use crate::text::{first_line, sanitize_text, truncate_chars};

const SNIPPET_CHARS: usize = 200;
const PARSE_ERROR_SUBJECT: &str = "(MIME parse error)";
const NO_SUBJECT: &str = "(no subject)";

/// One message ready for normalization.
#[derive(Debug, Clone, Copy)]
pub struct RawInput<'a> {
    pub raw: &'a [u8],
    pub raw_hash: &'a str,
    pub dedup_key: &'a str,
    pub fallback_date: Option<DateTime<Utc>>,
    pub label_ids: &'a [i64],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub message_id: i64,
    /// One entry per attachment that could not be stored.
    pub attachment_errors: Vec<String>,
}

pub struct MessageNormalizer<'a> {
    store: &'a dyn Store,
    parser: &'a dyn MimeParser,
    attachments: &'a AttachmentContentStore,
    source_id: i64,
    identifier: String,
}

impl<'a> MessageNormalizer<'a> {
    pub fn new(
        store: &'a dyn Store,
        parser: &'a dyn MimeParser,
        attachments: &'a AttachmentContentStore,
        source_id: i64,
        identifier: &str,
    ) -> Self {
        Self {
            store,
            parser,
            attachments,
            source_id,
            identifier: identifier.trim().to_lowercase(),
        }
    }

    /// Commit one message. `Err` means nothing was committed.
    pub async fn normalize(&self, input: RawInput<'_>) -> Result<Normalized, StoreError> {
        let parsed = match self.parser.parse(input.raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!(
                    "failed to parse MIME for {}, storing placeholder: {}",
                    input.dedup_key,
                    err
                );
                placeholder(&err.to_string(), input.fallback_date)
            }
        };

        let subject = sanitize_text(&parsed.subject);
        let body_text = sanitize_text(&parsed.body_text());
        let body_html = sanitize_text(&parsed.body_html);

        let from = sanitize_addresses(&parsed.from);
        let to = sanitize_addresses(&parsed.to);
        let cc = sanitize_addresses(&parsed.cc);
        let bcc = sanitize_addresses(&parsed.bcc);

        let participants = unique_participants([&from, &to, &cc, &bcc]);
        let participant_ids = self.store.ensure_participants_batch(&participants).await?;

        let sender_id = from
            .first()
            .and_then(|address| participant_ids.get(&address.email).copied());
        let is_from_me = from
            .first()
            .is_some_and(|address| !address.email.is_empty() && address.email == self.identifier);

        let thread = thread_key(&parsed, input.raw_hash);
        let title = if subject.is_empty() {
            NO_SUBJECT
        } else {
            subject.as_str()
        };
        let conversation_id = self
            .store
            .ensure_conversation(self.source_id, &thread, title)
            .await?;

        let mut recipients = Vec::new();
        for (kind, addresses) in [
            (RecipientKind::From, &from),
            (RecipientKind::To, &to),
            (RecipientKind::Cc, &cc),
            (RecipientKind::Bcc, &bcc),
        ] {
            recipients.extend(recipient_set(kind, addresses, &participant_ids));
        }

        let record = MessageRecord {
            source_id: self.source_id,
            source_message_id: input.dedup_key.to_string(),
            conversation_id,
            message_id_header: parsed.message_id.clone(),
            snippet: snippet(&body_text),
            subject,
            sent_at: parsed.date.or(input.fallback_date),
            sender_id,
            is_from_me,
            size_estimate: input.raw.len() as i64,
            attachment_count: parsed.attachments.len() as i32,
            body_text,
            body_html,
            raw: input.raw.to_vec(),
            raw_hash: input.raw_hash.to_string(),
            recipients,
            label_ids: input.label_ids.to_vec(),
        };
        let message_id = self.store.persist_message(&record).await?;

        let attachment_errors = self.store_attachments(message_id, &parsed).await;
        if !parsed.attachments.is_empty() && attachment_errors.is_empty() {
            if let Err(err) = self.store.mark_attachments_stored(message_id).await {
                log::warn!(
                    "failed to mark attachments stored for message {}: {}",
                    message_id,
                    err
                );
                return Ok(Normalized {
                    message_id,
                    attachment_errors: vec![err.to_string()],
                });
            }
        }

        Ok(Normalized {
            message_id,
            attachment_errors,
        })
    }

    async fn store_attachments(&self, message_id: i64, parsed: &ParsedMessage) -> Vec<String> {
        let mut errors = Vec::new();
        for attachment in &parsed.attachments {
            let blob = match self
                .attachments
                .store(&attachment.content, attachment.content_hash.as_deref())
            {
                Ok(Some(blob)) => blob,
                Ok(None) => continue,
                Err(err) => {
                    log::warn!(
                        "failed to store attachment {:?} of message {}: {}",
                        attachment.filename,
                        message_id,
                        err
                    );
                    errors.push(err.to_string());
                    continue;
                }
            };

            let record = AttachmentRecord {
                filename: sanitize_text(&attachment.filename),
                content_type: sanitize_text(&attachment.content_type),
                storage_path: blob.storage_path,
                content_hash: blob.content_hash,
                size: blob.size as i64,
            };
            if let Err(err) = self.store.upsert_attachment(message_id, &record).await {
                log::warn!(
                    "failed to link attachment {:?} of message {}: {}",
                    attachment.filename,
                    message_id,
                    err
                );
                errors.push(err.to_string());
            }
        }
        errors
    }
}

fn placeholder(error: &str, fallback_date: Option<DateTime<Utc>>) -> ParsedMessage {
    ParsedMessage {
        subject: PARSE_ERROR_SUBJECT.to_string(),
        body_text: format!(
            "[MIME parsing failed: {}]\n\nRaw MIME data is preserved with the message.",
            first_line(error)
        ),
        date: fallback_date,
        ..ParsedMessage::default()
    }
}

fn sanitize_addresses(addresses: &[Address]) -> Vec<Address> {
    addresses
        .iter()
        .map(|address| Address::new(sanitize_text(&address.name), sanitize_text(&address.email)))
        .collect()
}

/// Every distinct address once, keeping the first non-empty display name.
fn unique_participants<const N: usize>(sets: [&Vec<Address>; N]) -> Vec<Address> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<Address> = Vec::new();
    for address in sets.into_iter().flatten() {
        if address.email.is_empty() {
            continue;
        }
        match positions.get(&address.email) {
            Some(&index) => {
                if unique[index].name.is_empty() && !address.name.is_empty() {
                    unique[index].name = address.name.clone();
                }
            }
            None => {
                positions.insert(address.email.clone(), unique.len());
                unique.push(address.clone());
            }
        }
    }
    unique
}

fn recipient_set(
    kind: RecipientKind,
    addresses: &[Address],
    participant_ids: &HashMap<String, i64>,
) -> Vec<Recipient> {
    let mut out: Vec<Recipient> = Vec::new();
    for address in addresses {
        let Some(&participant_id) = participant_ids.get(&address.email) else {
            continue;
        };
        match out.iter_mut().find(|r| r.participant_id == participant_id) {
            Some(existing) => {
                if existing.display_name.is_empty() && !address.name.is_empty() {
                    existing.display_name = address.name.clone();
                }
            }
            None => out.push(Recipient {
                kind,
                participant_id,
                display_name: address.name.clone(),
            }),
        }
    }
    out
}

/// Conversation key: root reference, then In-Reply-To, then Message-ID,
/// then the content hash.
fn thread_key(parsed: &ParsedMessage, raw_hash: &str) -> String {
    parsed
        .references
        .first()
        .cloned()
        .and_then(|id| normalize_message_id(Some(id)))
        .or_else(|| normalize_message_id(parsed.in_reply_to.clone()))
        .or_else(|| normalize_message_id(parsed.message_id.clone()))
        .unwrap_or_else(|| raw_hash.to_string())
}

fn snippet(body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return String::new();
    }
    truncate_chars(first_line(body), SNIPPET_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::{Attachment, MailParser, MimeError};
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    struct BrokenParser;

    impl MimeParser for BrokenParser {
        fn parse(&self, _raw: &[u8]) -> Result<ParsedMessage, MimeError> {
            Err(MimeError::Parse(mailparse::MailParseError::Generic(
                "bad boundary\nsecond line",
            )))
        }
    }

    struct FixedParser(ParsedMessage);

    impl MimeParser for FixedParser {
        fn parse(&self, _raw: &[u8]) -> Result<ParsedMessage, MimeError> {
            Ok(self.0.clone())
        }
    }

    fn input<'a>(raw: &'a [u8], key: &'a str, labels: &'a [i64]) -> RawInput<'a> {
        RawInput {
            raw,
            raw_hash: "feedface",
            dedup_key: key,
            fallback_date: None,
            label_ids: labels,
        }
    }

    #[test]
    fn thread_key_priority() {
        let mut parsed = ParsedMessage {
            message_id: Some("self@x".into()),
            in_reply_to: Some("<parent@x>".into()),
            references: vec!["<root@x>".into(), "parent@x".into()],
            ..ParsedMessage::default()
        };
        assert_eq!(thread_key(&parsed, "hash"), "root@x");
        parsed.references.clear();
        assert_eq!(thread_key(&parsed, "hash"), "parent@x");
        parsed.in_reply_to = Some("  <>  ".into());
        assert_eq!(thread_key(&parsed, "hash"), "self@x");
        parsed.message_id = None;
        assert_eq!(thread_key(&parsed, "hash"), "hash");
    }

    #[test]
    fn snippet_uses_first_non_empty_line() {
        assert_eq!(snippet("\n\n  hello there\nsecond"), "hello there");
        let long = "x".repeat(300);
        assert_eq!(snippet(&long).chars().count(), SNIPPET_CHARS);
        assert_eq!(snippet("   "), "");
    }

    #[test]
    fn participants_prefer_first_non_empty_name() {
        let from = vec![Address::new("", "a@example.com")];
        let to = vec![
            Address::new("Alice", "A@example.com"),
            Address::new("Bob", "b@example.com"),
        ];
        let unique = unique_participants([&from, &to]);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].email, "a@example.com");
        assert_eq!(unique[0].name, "Alice");
    }

    #[tokio::test]
    async fn commits_parsed_message() {
        let store = MemoryStore::new();
        let parser = MailParser::new();
        let attachments = AttachmentContentStore::new("");
        let normalizer =
            MessageNormalizer::new(&store, &parser, &attachments, 1, "Me@Example.com");
        let raw = b"From: Me <me@example.com>\r\nTo: You <you@example.com>\r\nSubject: Hi\r\nMessage-ID: <m1@example.com>\r\n\r\nHello\r\n";

        let result = normalizer
            .normalize(input(raw, "mbox-abc-1", &[7]))
            .await
            .expect("normalize");
        assert!(result.attachment_errors.is_empty());

        let stored = store.message_by_key("mbox-abc-1").expect("stored");
        assert_eq!(stored.id, result.message_id);
        assert_eq!(stored.subject, "Hi");
        assert_eq!(stored.snippet, "Hello");
        assert!(stored.is_from_me);
        assert_eq!(stored.raw, raw.to_vec());
        assert!(stored.labels.contains(&7));
        assert_eq!(stored.recipients.len(), 2);
        assert_eq!(store.conversation_count(), 1);
    }

    #[tokio::test]
    async fn parse_failure_stores_placeholder() {
        let store = MemoryStore::new();
        let attachments = AttachmentContentStore::new("");
        let normalizer = MessageNormalizer::new(&store, &BrokenParser, &attachments, 1, "me@x");
        let fallback = DateTime::parse_from_rfc3339("2020-01-02T03:04:05Z")
            .expect("date")
            .with_timezone(&Utc);

        let mut raw_input = input(b"garbage", "key", &[]);
        raw_input.fallback_date = Some(fallback);
        normalizer.normalize(raw_input).await.expect("normalize");

        let stored = store.message_by_key("key").expect("stored");
        assert_eq!(stored.subject, PARSE_ERROR_SUBJECT);
        assert!(stored.body_text.starts_with("[MIME parsing failed: "));
        assert!(!stored.body_text.contains("second line"));
        assert_eq!(stored.sent_at, Some(fallback));
        assert_eq!(stored.raw, b"garbage".to_vec());
    }

    #[tokio::test]
    async fn attachments_are_stored_and_linked() {
        let dir = TempDir::new().expect("tempdir");
        let store = MemoryStore::new();
        let parser = FixedParser(ParsedMessage {
            subject: "files".into(),
            attachments: vec![Attachment {
                filename: "a.txt".into(),
                content_type: "text/plain".into(),
                content: b"attachment body".to_vec(),
                ..Attachment::default()
            }],
            ..ParsedMessage::default()
        });
        let attachments = AttachmentContentStore::new(dir.path());
        let normalizer = MessageNormalizer::new(&store, &parser, &attachments, 1, "me@x");

        let result = normalizer
            .normalize(input(b"raw", "key", &[]))
            .await
            .expect("normalize");
        assert!(result.attachment_errors.is_empty());

        let linked = store.attachments(result.message_id);
        assert_eq!(linked.len(), 1);
        assert!(dir.path().join(&linked[0].storage_path).is_file());
        let stored = store.message_by_key("key").expect("stored");
        assert!(!stored.attachments_pending);
    }

    #[tokio::test]
    async fn attachment_hash_mismatch_leaves_message_pending() {
        let dir = TempDir::new().expect("tempdir");
        let store = MemoryStore::new();
        let parser = FixedParser(ParsedMessage {
            attachments: vec![Attachment {
                filename: "bad.bin".into(),
                content: b"bytes".to_vec(),
                content_hash: Some("0".repeat(64)),
                ..Attachment::default()
            }],
            ..ParsedMessage::default()
        });
        let attachments = AttachmentContentStore::new(dir.path());
        let normalizer = MessageNormalizer::new(&store, &parser, &attachments, 1, "me@x");

        let result = normalizer
            .normalize(input(b"raw", "key", &[]))
            .await
            .expect("message still commits");
        assert_eq!(result.attachment_errors.len(), 1);
        let stored = store.message_by_key("key").expect("stored");
        assert!(stored.attachments_pending);
        assert_eq!(stored.subject, "");

        let committed = store
            .message_exists_with_raw_batch(1, &["key".to_string()])
            .await
            .expect("exists");
        assert!(committed.is_empty());
    }
}
