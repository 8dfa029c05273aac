//! Lenient parsing of RSS `<pubDate>` values.
//!
//! Feeds in the wild mix RFC 1123, RFC 822 and ISO 8601 timestamps, with
//! numeric or named zones. [`parse_pub_date`] tries a fixed list of layouts
//! in priority order and returns the first successful parse.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use thiserror::Error;

/// No known layout matched the input.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Could not parse date: {0:?}")]
pub struct DateParseError(pub String);

/// Supported layouts, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateLayout {
    /// `Mon, 02 Jan 2006 15:04:05 -0700`
    Rfc1123Numeric,
    /// `Mon, 02 Jan 2006 15:04:05 MST`
    Rfc1123Named,
    /// `02 Jan 06 15:04 MST`
    Rfc822Named,
    /// `02 Jan 06 15:04 -0700`
    Rfc822Numeric,
    /// RFC 1123 with either zone style, but the weekday is not cross-checked
    /// against the date. Feeds often get it wrong.
    Rfc1123Lenient,
    /// `2006-01-02T15:04:05Z`
    Iso8601Utc,
}

impl DateLayout {
    pub const PRIORITY: [DateLayout; 6] = [
        DateLayout::Rfc1123Numeric,
        DateLayout::Rfc1123Named,
        DateLayout::Rfc822Named,
        DateLayout::Rfc822Numeric,
        DateLayout::Rfc1123Lenient,
        DateLayout::Iso8601Utc,
    ];

    fn parse(self, s: &str) -> Option<DateTime<FixedOffset>> {
        match self {
            DateLayout::Rfc1123Numeric => {
                DateTime::parse_from_str(s, "%a, %d %b %Y %H:%M:%S%.f %z").ok()
            }
            DateLayout::Rfc1123Named => parse_named_zone(s, "%a, %d %b %Y %H:%M:%S%.f"),
            DateLayout::Rfc822Named => parse_named_zone(s, "%d %b %y %H:%M"),
            DateLayout::Rfc822Numeric => DateTime::parse_from_str(s, "%d %b %y %H:%M %z").ok(),
            DateLayout::Rfc1123Lenient => {
                let (weekday, rest) = s.split_once(',')?;
                if weekday.is_empty() || !weekday.chars().all(|c| c.is_ascii_alphabetic()) {
                    return None;
                }
                let rest = rest.trim_start();
                DateTime::parse_from_str(rest, "%d %b %Y %H:%M:%S%.f %z")
                    .ok()
                    .or_else(|| parse_named_zone(rest, "%d %b %Y %H:%M:%S%.f"))
            }
            DateLayout::Iso8601Utc => NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.fZ")
                .ok()
                .map(|naive| naive.and_utc().fixed_offset()),
        }
    }
}

/// Parse a feed item's publication date.
///
/// Surrounding whitespace is ignored. The result keeps the offset found in
/// the input; callers normalize to UTC.
///
/// # Examples
///
/// ```
/// use feedsniff::feed::parse_pub_date;
///
/// let dt = parse_pub_date("Mon, 02 Jan 2006 15:04:05 -0700").unwrap();
/// assert_eq!(dt.timestamp(), 1136239445);
///
/// assert!(parse_pub_date("yesterday").is_err());
/// ```
pub fn parse_pub_date(raw: &str) -> Result<DateTime<FixedOffset>, DateParseError> {
    parse_with_layout(raw)
        .map(|(dt, _)| dt)
        .ok_or_else(|| DateParseError(raw.trim().to_string()))
}

/// Like [`parse_pub_date`], also reporting which layout matched.
pub fn parse_with_layout(raw: &str) -> Option<(DateTime<FixedOffset>, DateLayout)> {
    let s = raw.trim();
    DateLayout::PRIORITY
        .iter()
        .find_map(|layout| layout.parse(s).map(|dt| (dt, *layout)))
}

/// Parse `<datetime> <ZONE>` where ZONE is an alphabetic abbreviation.
fn parse_named_zone(s: &str, format: &str) -> Option<DateTime<FixedOffset>> {
    let (datetime, zone) = s.rsplit_once(' ')?;
    let offset = zone_offset(zone)?;
    let naive = NaiveDateTime::parse_from_str(datetime.trim_end(), format).ok()?;
    offset.from_local_datetime(&naive).single()
}

/// Offset for a named zone.
///
/// RFC 822 zones and a few common abbreviations resolve to their offsets.
/// Any other purely alphabetic abbreviation is accepted at UTC, since the
/// abbreviation alone does not identify an offset.
fn zone_offset(zone: &str) -> Option<FixedOffset> {
    if zone.is_empty() || zone.len() > 5 || !zone.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }

    let hours = match zone.to_ascii_uppercase().as_str() {
        "UT" | "UTC" | "GMT" | "Z" => 0,
        "EST" => -5,
        "EDT" => -4,
        "CST" => -6,
        "CDT" => -5,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        "BST" | "CET" => 1,
        "CEST" => 2,
        "JST" => 9,
        _ => 0,
    };
    FixedOffset::east_opt(hours * 3600)
}
