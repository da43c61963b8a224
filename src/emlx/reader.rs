//! Parser for single `.emlx` files.
//!
//! Layout: a decimal byte count on the first line, exactly that many bytes of
//! RFC 5322 message, then an optional XML property list with client metadata.
//! Metadata is best effort; anything malformed simply leaves the defaults.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;

use super::EmlxError;

/// Seconds between the Unix epoch and 2001-01-01T00:00:00Z.
const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmlxMetadata {
    pub date_sent: Option<DateTime<Utc>>,
    pub flags: i64,
    pub original_mailbox: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmlxMessage {
    pub raw: Vec<u8>,
    pub metadata: EmlxMetadata,
}

pub fn parse_emlx(data: &[u8]) -> Result<EmlxMessage, EmlxError> {
    if data.is_empty() {
        return Err(EmlxError::Empty);
    }

    let newline = data
        .iter()
        .position(|b| *b == b'\n')
        .ok_or(EmlxError::MissingByteCount)?;
    let count_text = String::from_utf8_lossy(&data[..newline]).trim().to_string();
    let byte_count: i64 = count_text
        .parse()
        .map_err(|_| EmlxError::InvalidByteCount(count_text.clone()))?;
    if byte_count < 0 {
        return Err(EmlxError::NegativeByteCount(byte_count));
    }

    let mime_start = newline + 1;
    let available = data.len() - mime_start;
    if byte_count as u64 > available as u64 {
        return Err(EmlxError::ByteCountExceedsFile {
            count: byte_count as u64,
            available: available as u64,
        });
    }
    let mime_end = mime_start + byte_count as usize;

    let metadata = parse_metadata(&data[mime_end..]).unwrap_or_default();

    Ok(EmlxMessage {
        raw: data[mime_start..mime_end].to_vec(),
        metadata,
    })
}

pub fn read_emlx_file(path: &Path) -> Result<EmlxMessage, EmlxError> {
    let data = std::fs::read(path).map_err(|source| EmlxError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_emlx(&data)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueElement {
    Key,
    Real,
    Integer,
    String,
}

/// Scan the trailing property list. `None` when no plist is present.
pub fn parse_metadata(trailer: &[u8]) -> Option<EmlxMetadata> {
    let start = find(trailer, b"<?xml").or_else(|| find(trailer, b"<plist"))?;

    let mut reader = Reader::from_reader(&trailer[start..]);
    reader.config_mut().trim_text(true);

    let mut metadata = EmlxMetadata::default();
    let mut buf = Vec::new();
    let mut in_dict = false;
    let mut element: Option<ValueElement> = None;
    let mut current_key = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                element = match e.local_name().as_ref() {
                    b"dict" => {
                        in_dict = true;
                        None
                    }
                    b"key" if in_dict => Some(ValueElement::Key),
                    b"real" if in_dict => Some(ValueElement::Real),
                    b"integer" if in_dict => Some(ValueElement::Integer),
                    b"string" if in_dict => Some(ValueElement::String),
                    _ => None,
                };
            }
            Ok(Event::Text(t)) => {
                if let Some(kind) = element {
                    let Ok(text) = t.unescape() else {
                        break;
                    };
                    apply_value(&mut metadata, &mut current_key, kind, text.trim());
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"dict" {
                    in_dict = false;
                }
                if element.is_some_and(|kind| kind != ValueElement::Key) {
                    current_key.clear();
                }
                element = None;
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    Some(metadata)
}

fn apply_value(
    metadata: &mut EmlxMetadata,
    current_key: &mut String,
    kind: ValueElement,
    text: &str,
) {
    match kind {
        ValueElement::Key => *current_key = text.to_string(),
        ValueElement::Real if current_key == "date-sent" => {
            if let Ok(seconds) = text.parse::<f64>() {
                metadata.date_sent = apple_date(seconds);
            }
        }
        ValueElement::Integer => match current_key.as_str() {
            "flags" => {
                if let Ok(flags) = text.parse::<i64>() {
                    metadata.flags = flags;
                }
            }
            "date-sent" => {
                if let Ok(seconds) = text.parse::<i64>() {
                    metadata.date_sent = apple_date(seconds as f64);
                }
            }
            _ => {}
        },
        ValueElement::String if current_key == "original-mailbox" => {
            metadata.original_mailbox = Some(text.to_string());
        }
        _ => {}
    }
}

fn apple_date(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let epoch = DateTime::from_timestamp(APPLE_EPOCH_OFFSET, 0)?;
    let whole = seconds.trunc() as i64;
    let nanos = ((seconds - seconds.trunc()) * 1_000_000_000.0) as i64;
    epoch
        .checked_add_signed(Duration::try_seconds(whole)?)?
        .checked_add_signed(Duration::nanoseconds(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emlx(mime: &str, trailer: &str) -> Vec<u8> {
        format!("{}\n{}{}", mime.len(), mime, trailer).into_bytes()
    }

    const PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>date-sent</key>
	<real>86400.5</real>
	<key>flags</key>
	<integer>8590195713</integer>
	<key>original-mailbox</key>
	<string>imap://user@example.com/INBOX</string>
</dict>
</plist>
"#;

    #[test]
    fn test_parse_with_metadata() {
        let mime = "Subject: hi\r\n\r\nbody\r\n";
        let message = parse_emlx(&emlx(mime, PLIST)).expect("parse");
        assert_eq!(message.raw, mime.as_bytes());
        let expected = DateTime::parse_from_rfc3339("2001-01-02T00:00:00.5Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        assert_eq!(message.metadata.date_sent, Some(expected));
        assert_eq!(message.metadata.flags, 8_590_195_713);
        assert_eq!(
            message.metadata.original_mailbox.as_deref(),
            Some("imap://user@example.com/INBOX")
        );
    }

    #[test]
    fn test_integer_date_sent() {
        let trailer = "<plist><dict><key>date-sent</key><integer>60</integer></dict></plist>";
        let message = parse_emlx(&emlx("Subject: x\n\n", trailer)).expect("parse");
        let expected = DateTime::from_timestamp(APPLE_EPOCH_OFFSET + 60, 0).expect("timestamp");
        assert_eq!(message.metadata.date_sent, Some(expected));
    }

    #[test]
    fn test_missing_or_malformed_metadata_is_default() {
        let message = parse_emlx(&emlx("Subject: x\n\n", "")).expect("parse");
        assert_eq!(message.metadata, EmlxMetadata::default());

        let broken = "<plist><dict><key>flags</key><integer>oops</integer><key>date-sent";
        let message = parse_emlx(&emlx("Subject: x\n\n", broken)).expect("parse");
        assert_eq!(message.metadata.flags, 0);
        assert!(message.metadata.date_sent.is_none());
    }

    #[test]
    fn test_whitespace_tolerant_count() {
        let data = b"  5  \nabcdeTRAILER".to_vec();
        let message = parse_emlx(&data).expect("parse");
        assert_eq!(message.raw, b"abcde");
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(parse_emlx(b""), Err(EmlxError::Empty)));
        assert!(matches!(parse_emlx(b"12"), Err(EmlxError::MissingByteCount)));
        assert!(matches!(
            parse_emlx(b"abc\nbody"),
            Err(EmlxError::InvalidByteCount(_))
        ));
        assert!(matches!(
            parse_emlx(b"-1\nbody"),
            Err(EmlxError::NegativeByteCount(-1))
        ));
        assert!(matches!(
            parse_emlx(b"100\nshort"),
            Err(EmlxError::ByteCountExceedsFile {
                count: 100,
                available: 5
            })
        ));
    }
}
