//! Small text helpers shared by the MIME adapter and the normalizer.

use regex::Regex;
use std::sync::OnceLock;

/// Remove NUL bytes that PostgreSQL cannot store, and trim.
pub fn sanitize_text(text: &str) -> String {
    text.replace('\0', "").trim().to_string()
}

/// Decode bytes as UTF-8, replacing invalid sequences.
pub fn sanitize_bytes(bytes: &[u8]) -> String {
    sanitize_text(&String::from_utf8_lossy(bytes))
}

/// First line of `text`, ignoring leading line breaks.
pub fn first_line(text: &str) -> &str {
    let text = text.trim_start_matches(['\r', '\n']);
    text.lines().next().unwrap_or("")
}

/// Truncate to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= 3 {
        return text.chars().take(max_chars).collect();
    }
    let mut out: String = text.chars().take(max_chars - 3).collect();
    out.push_str("...");
    out
}

static BLOCK_TAG: OnceLock<Regex> = OnceLock::new();
static DROPPED_ELEMENTS: OnceLock<Regex> = OnceLock::new();
static ANY_TAG: OnceLock<Regex> = OnceLock::new();
static ENTITY: OnceLock<Regex> = OnceLock::new();

fn block_tag_regex() -> &'static Regex {
    BLOCK_TAG.get_or_init(|| {
        Regex::new(
            r"(?i)<(/?)(p|div|br|hr|h[1-6]|li|tr|td|th|blockquote|pre|table|ul|ol|dl|dt|dd)[^>]*>",
        )
        .expect("Invalid block tag regex")
    })
}

fn dropped_elements_regex() -> &'static Regex {
    DROPPED_ELEMENTS.get_or_init(|| {
        Regex::new(r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>|<head[^>]*>.*?</head>")
            .expect("Invalid dropped element regex")
    })
}

fn any_tag_regex() -> &'static Regex {
    ANY_TAG.get_or_init(|| Regex::new(r"<[^>]*>").expect("Invalid tag regex"))
}

fn entity_regex() -> &'static Regex {
    ENTITY.get_or_init(|| {
        Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});")
            .expect("Invalid entity regex")
    })
}

fn decode_entity(entity: &str) -> Option<String> {
    let named = match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{00A0}'),
        _ => None,
    };
    if let Some(c) = named {
        return Some(c.to_string());
    }
    let code = entity.strip_prefix('#')?;
    let value = match code.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => code.parse::<u32>().ok()?,
    };
    char::from_u32(value).map(|c| c.to_string())
}

/// Render HTML as readable plain text.
///
/// Scripts, styles and the head are dropped, block elements become line
/// breaks, entities are decoded and runs of whitespace collapse.
pub fn strip_html(html: &str) -> String {
    let text = dropped_elements_regex().replace_all(html, "");
    let text = block_tag_regex().replace_all(&text, "\n");
    let text = any_tag_regex().replace_all(&text, "");
    let text = entity_regex().replace_all(&text, |caps: &regex::Captures| {
        decode_entity(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    });

    let text = text
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\u{00A0}', " ");

    let mut text = text
        .split('\n')
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n");

    while text.contains("\n\n\n") {
        text = text.replace("\n\n\n", "\n\n");
    }

    text.trim().to_string()
}
