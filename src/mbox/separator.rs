//! Boundary detection for `From ` separator lines.
//!
//! A line only counts as a message boundary when the words after the sender
//! parse as a ctime-like date. Layouts are tried in a fixed order: weekday
//! present or absent, seconds present or absent, and a timezone that is
//! absent, numeric (`-0700` / `-07:00`) or named, either before or after the
//! year.
//!
//! Permissive mode is used to decide whether a line is a boundary at all, so
//! any plausible zone name is accepted (unknown names resolve to UTC). Strict
//! mode is used when the date itself matters: only numeric offsets and a small
//! allow-list of abbreviations are honored, and a zone-shaped token that is
//! not understood rejects the layout instead of being silently dropped.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};

/// How unrecognized timezone tokens are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateMode {
    Permissive,
    Strict,
}

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const WEEKDAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

const ZONE_ABBREVIATIONS: [(&str, i32); 15] = [
    ("UTC", 0),
    ("GMT", 0),
    ("UT", 0),
    ("Z", 0),
    ("EST", -5),
    ("EDT", -4),
    ("CST", -6),
    ("CDT", -5),
    ("MST", -7),
    ("MDT", -6),
    ("PST", -8),
    ("PDT", -7),
    ("AKST", -9),
    ("AKDT", -8),
    ("HST", -10),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZoneKind {
    Numeric,
    NumericColon,
    Named,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZonePosition {
    BeforeYear,
    AfterYear,
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    weekday: bool,
    seconds: bool,
    zone: Option<(ZoneKind, ZonePosition)>,
}

impl Layout {
    fn field_count(&self) -> usize {
        // month, day, clock, year
        4 + usize::from(self.weekday) + usize::from(self.zone.is_some())
    }
}

const ZONE_ORDER: [Option<(ZoneKind, ZonePosition)>; 7] = [
    None,
    Some((ZoneKind::Numeric, ZonePosition::BeforeYear)),
    Some((ZoneKind::NumericColon, ZonePosition::BeforeYear)),
    Some((ZoneKind::Named, ZonePosition::BeforeYear)),
    Some((ZoneKind::Numeric, ZonePosition::AfterYear)),
    Some((ZoneKind::NumericColon, ZonePosition::AfterYear)),
    Some((ZoneKind::Named, ZonePosition::AfterYear)),
];

fn layouts() -> impl Iterator<Item = Layout> {
    [true, false].into_iter().flat_map(|weekday| {
        [true, false].into_iter().flat_map(move |seconds| {
            ZONE_ORDER.into_iter().map(move |zone| Layout {
                weekday,
                seconds,
                zone,
            })
        })
    })
}

/// Parse the date of a separator line, accepting any plausible zone name.
pub fn parse_separator_date(line: &str) -> Option<DateTime<Utc>> {
    parse_with_mode(line, DateMode::Permissive)
}

/// Parse the date of a separator line, honoring only well-known zones.
pub fn parse_separator_date_strict(line: &str) -> Option<DateTime<Utc>> {
    parse_with_mode(line, DateMode::Strict)
}

/// True when `line` is a genuine mbox message boundary.
pub fn is_separator_line(line: &str) -> bool {
    line.starts_with("From ") && parse_separator_date(line).is_some()
}

pub fn parse_with_mode(line: &str, mode: DateMode) -> Option<DateTime<Utc>> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 || fields[0] != "From" {
        return None;
    }

    for layout in layouts() {
        let needed = layout.field_count();
        if fields.len() < 2 + needed {
            continue;
        }

        if mode == DateMode::Strict
            && layout.zone.is_none()
            && fields.len() > 2 + needed
            && looks_like_zone_token(fields[2 + needed])
        {
            continue;
        }

        if let Some(parsed) = parse_layout(&fields[2..2 + needed], layout, mode) {
            return Some(parsed);
        }
    }

    None
}

fn parse_layout(fields: &[&str], layout: Layout, mode: DateMode) -> Option<DateTime<Utc>> {
    let mut tokens = fields.iter().copied();

    if layout.weekday && !is_weekday(tokens.next()?) {
        return None;
    }
    let month = parse_month(tokens.next()?)?;
    let day = parse_number(tokens.next()?, 1, 2)?;
    let clock = parse_clock(tokens.next()?, layout.seconds)?;

    let (year_token, zone_token) = match layout.zone {
        None => (tokens.next()?, None),
        Some((_, ZonePosition::BeforeYear)) => {
            let zone = tokens.next()?;
            (tokens.next()?, Some(zone))
        }
        Some((_, ZonePosition::AfterYear)) => {
            let year = tokens.next()?;
            (year, tokens.next())
        }
    };

    if year_token.len() != 4 {
        return None;
    }
    let year = parse_number(year_token, 4, 4)?;

    let offset_seconds = match (layout.zone, zone_token) {
        (None, _) => 0,
        (Some((kind, _)), Some(token)) => match kind {
            ZoneKind::Numeric => parse_numeric_offset(token, false)?,
            ZoneKind::NumericColon => parse_numeric_offset(token, true)?,
            ZoneKind::Named => named_zone_offset(token, mode)?,
        },
        (Some(_), None) => return None,
    };

    let date = NaiveDate::from_ymd_opt(year as i32, month, day)?;
    let offset = FixedOffset::east_opt(offset_seconds)?;
    offset
        .from_local_datetime(&date.and_time(clock))
        .single()
        .map(|local| local.with_timezone(&Utc))
}

fn is_weekday(token: &str) -> bool {
    WEEKDAYS
        .iter()
        .any(|day| token.eq_ignore_ascii_case(day))
}

fn parse_month(token: &str) -> Option<u32> {
    MONTHS
        .iter()
        .position(|month| token.eq_ignore_ascii_case(month))
        .map(|index| index as u32 + 1)
}

fn parse_number(token: &str, min_digits: usize, max_digits: usize) -> Option<u32> {
    if token.len() < min_digits
        || token.len() > max_digits
        || !token.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    token.parse().ok()
}

fn parse_clock(token: &str, with_seconds: bool) -> Option<NaiveTime> {
    let mut parts = token.split(':');
    let hour = parse_number(parts.next()?, 1, 2)?;
    let minute = parse_number(parts.next()?, 2, 2)?;
    let second = if with_seconds {
        parse_number(parts.next()?, 2, 2)?
    } else {
        0
    };
    if parts.next().is_some() {
        return None;
    }
    NaiveTime::from_hms_opt(hour, minute, second)
}

fn parse_numeric_offset(token: &str, with_colon: bool) -> Option<i32> {
    let (sign, rest) = match token.as_bytes().first()? {
        b'+' => (1, &token[1..]),
        b'-' => (-1, &token[1..]),
        _ => return None,
    };
    if !rest.is_ascii() {
        return None;
    }
    let (hours, minutes) = if with_colon {
        rest.split_once(':')?
    } else {
        if rest.len() != 4 {
            return None;
        }
        rest.split_at(2)
    };
    let hours = parse_number(hours, 2, 2)? as i32;
    let minutes = parse_number(minutes, 2, 2)? as i32;
    if hours > 24 || minutes > 59 {
        return None;
    }
    Some(sign * (hours * 3600 + minutes * 60))
}

fn known_zone_offset(token: &str) -> Option<i32> {
    let name = token.trim_matches(|c| c == '(' || c == ')');
    ZONE_ABBREVIATIONS
        .iter()
        .find(|(abbrev, _)| name.eq_ignore_ascii_case(abbrev))
        .map(|(_, hours)| hours * 3600)
}

fn named_zone_offset(token: &str, mode: DateMode) -> Option<i32> {
    match mode {
        DateMode::Strict => known_zone_offset(token),
        DateMode::Permissive => known_zone_offset(token).or_else(|| unknown_zone_offset(token)),
    }
}

/// Offset for an abbreviation outside the table. Accepted shapes are three
/// uppercase letters, four or five ending in `T` (plus `WITA`, `ChST` and
/// `MeST`), and `GMT` with an optional signed hour. Unknown names count as UTC.
fn unknown_zone_offset(token: &str) -> Option<i32> {
    if token == "ChST" || token == "MeST" {
        return Some(0);
    }
    if let Some(rest) = token.strip_prefix("GMT") {
        return gmt_offset(rest);
    }
    if !token.bytes().all(|b| b.is_ascii_uppercase()) {
        return None;
    }
    let accepted = match token.len() {
        3 => true,
        4 => token.ends_with('T') || token == "WITA",
        5 => token.ends_with('T'),
        _ => false,
    };
    accepted.then_some(0)
}

fn gmt_offset(rest: &str) -> Option<i32> {
    if rest.is_empty() {
        return Some(0);
    }
    let (sign, hours) = match rest.as_bytes()[0] {
        b'+' => (1, &rest[1..]),
        b'-' => (-1, &rest[1..]),
        _ => return None,
    };
    let hours = parse_number(hours, 1, 2)? as i32;
    (hours <= 23).then_some(sign * hours * 3600)
}

fn looks_like_numeric_offset(token: &str) -> bool {
    parse_numeric_offset(token, false).is_some() || parse_numeric_offset(token, true).is_some()
}

/// True for tokens shaped like a timezone: a known abbreviation, a numeric
/// offset, or a plausible unknown abbreviation.
pub fn looks_like_zone_token(token: &str) -> bool {
    let token = token.trim_matches(|c| c == '(' || c == ')');
    known_zone_offset(token).is_some()
        || looks_like_numeric_offset(token)
        || unknown_zone_offset(token).is_some()
}
