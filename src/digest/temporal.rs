//! Temporal extraction (T-ex).
//!
//! A deterministic regex mini-parser over subject + snippet that emits
//! intrinsic timestamps only. It never reads the clock: a date without an
//! explicit year is left absent rather than guessed, and failure to
//! parse is not an error.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use regex::Regex;

use crate::types::TemporalContext;

/// A datetime found in text, with its byte span so keyword scopes can
/// claim the nearest one and range suffixes can be read after it.
#[derive(Debug, Clone, Copy)]
struct Found {
    at: usize,
    end: usize,
    value: DateTime<Utc>,
    has_time: bool,
}

fn textual_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // "Nov 21, 2025 6:30pm", "November 21 2025", optionally preceded
        // by a weekday, optionally followed by "at"/time.
        Regex::new(
            r"(?ix)
            (?:(?:mon|tue|wed|thu|fri|sat|sun)[a-z]*\s+)?
            (jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\s+
            (\d{1,2}) ,?\s+ (\d{4})
            (?:\s+(?:at\s+)? (\d{1,2}) (?::(\d{2}))? \s* (am|pm))?",
        )
        .expect("textual date pattern")
    })
}

fn iso_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})(?:[T ](\d{2}):(\d{2})(?::\d{2})?Z?)?")
            .expect("iso date pattern")
    })
}

/// Time-only continuation of a range: " - 8pm", " to 20:00", "– 8:00pm".
fn range_end_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?ix)^\s*(?:-|–|—|to|until)\s*(\d{1,2})(?::(\d{2}))?\s*(am|pm)?")
            .expect("range end pattern")
    })
}

fn month_number(name: &str) -> u32 {
    match &name.to_lowercase()[..3] {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        _ => 12,
    }
}

fn to_24h(hour: u32, meridiem: Option<&str>) -> u32 {
    match meridiem {
        Some(m) if m.eq_ignore_ascii_case("pm") && hour < 12 => hour + 12,
        Some(m) if m.eq_ignore_ascii_case("am") && hour == 12 => 0,
        _ => hour,
    }
}

/// Every datetime in the text, in order of appearance. Invalid dates
/// (Feb 30) are silently skipped.
fn find_datetimes(text: &str) -> Vec<Found> {
    let mut found = Vec::new();

    for caps in textual_re().captures_iter(text) {
        let month = month_number(caps.get(1).map(|m| m.as_str()).unwrap_or(""));
        let day: u32 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let year: i32 = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else { continue };

        let (hour, minute, has_time) = match caps.get(4) {
            Some(h) => {
                let raw: u32 = h.as_str().parse().unwrap_or(0);
                let minute: u32 =
                    caps.get(5).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
                (to_24h(raw, caps.get(6).map(|m| m.as_str())), minute, true)
            }
            None => (0, 0, false),
        };
        let Some(naive) = date.and_hms_opt(hour, minute, 0) else { continue };
        let span = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        found.push(Found {
            at: span.0,
            end: span.1,
            value: Utc.from_utc_datetime(&naive),
            has_time,
        });
    }

    for caps in iso_re().captures_iter(text) {
        let year: i32 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let month: u32 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let day: u32 = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else { continue };
        let (hour, minute, has_time) = match (caps.get(4), caps.get(5)) {
            (Some(h), Some(m)) => (
                h.as_str().parse().unwrap_or(0),
                m.as_str().parse().unwrap_or(0),
                true,
            ),
            _ => (0, 0, false),
        };
        let Some(naive) = date.and_hms_opt(hour, minute, 0) else { continue };
        let span = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        found.push(Found {
            at: span.0,
            end: span.1,
            value: Utc.from_utc_datetime(&naive),
            has_time,
        });
    }

    found.sort_by_key(|f| f.at);
    found
}

fn keyword_re(patterns: &'static str, cell: &'static OnceLock<Regex>) -> &'static Regex {
    cell.get_or_init(|| Regex::new(patterns).expect("keyword pattern"))
}

fn delivery_keyword() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    keyword_re(
        r"(?i)\b(?:delivered\s+on|delivery\s+(?:scheduled|expected)\s+(?:for|on)|arriving\s+(?:on\s+)?)",
        &RE,
    )
}

fn expiration_keyword() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    keyword_re(r"(?i)\b(?:expires?\s+(?:on\s+)?|offer\s+ends\s+(?:on\s+)?|valid\s+until\s+)", &RE)
}

fn purchase_keyword() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    keyword_re(r"(?i)\b(?:order\s+placed\s+(?:on\s+)?|purchased\s+(?:on\s+)?|bought\s+on\s+)", &RE)
}

/// How far after a keyword a datetime may sit and still be claimed by it.
const KEYWORD_WINDOW: usize = 40;

/// Extract intrinsic temporal context from subject + snippet.
pub fn extract(subject: &str, snippet: &str) -> TemporalContext {
    let text = format!("{}\n{}", subject, snippet);
    let datetimes = find_datetimes(&text);
    if datetimes.is_empty() {
        return TemporalContext::default();
    }

    let mut claimed = vec![false; datetimes.len()];
    let mut ctx = TemporalContext::default();

    let mut claim_after = |keyword: &Regex, claimed: &mut Vec<bool>| -> Option<DateTime<Utc>> {
        for m in keyword.find_iter(&text) {
            for (i, found) in datetimes.iter().enumerate() {
                if claimed[i] {
                    continue;
                }
                if found.at >= m.end() && found.at - m.end() <= KEYWORD_WINDOW {
                    claimed[i] = true;
                    return Some(found.value);
                }
            }
        }
        None
    };

    ctx.delivery_date = claim_after(delivery_keyword(), &mut claimed);
    ctx.expiration_date = claim_after(expiration_keyword(), &mut claimed);
    ctx.purchase_date = claim_after(purchase_keyword(), &mut claimed);

    // Whatever is left is event time: first unclaimed datetime is the
    // start, a second one (not before the start) is the end.
    let mut remaining = datetimes.iter().enumerate().filter(|(i, _)| !claimed[*i]).map(|(_, f)| *f);
    if let Some(start) = remaining.next() {
        ctx.event_start = Some(start.value);
        if let Some(end) = remaining.find(|f| f.value >= start.value) {
            ctx.event_end = Some(end.value);
        } else if start.has_time {
            // "6:30pm - 8pm": a bare end time right after the start match.
            let after_start = &text[start.end.min(text.len())..];
            if let Some(caps) = range_end_re().captures(after_start) {
                let hour: u32 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
                let minute: u32 =
                    caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
                let hour = to_24h(hour, caps.get(3).map(|m| m.as_str()));
                let end = start
                    .value
                    .date_naive()
                    .and_hms_opt(hour, minute, 0)
                    .map(|naive| Utc.from_utc_datetime(&naive));
                if let Some(end) = end {
                    if end >= start.value {
                        ctx.event_end = Some(end);
                    }
                }
            }
        }
    }

    if ctx.validate().is_err() {
        // Inconsistent range: keep the start, drop the end.
        ctx.event_end = None;
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_event_with_weekday_and_time() {
        let ctx = extract("Dinner @ Fri Nov 21, 2025 6:30pm", "See you there");
        assert_eq!(ctx.event_start, Some(utc(2025, 11, 21, 18, 30)));
        assert_eq!(ctx.event_end, None);
    }

    #[test]
    fn test_event_without_time_is_midnight() {
        let ctx = extract("Conference Nov 21, 2025", "");
        assert_eq!(ctx.event_start, Some(utc(2025, 11, 21, 0, 0)));
    }

    #[test]
    fn test_iso_datetime() {
        let ctx = extract("Maintenance window", "Starts 2025-11-21T18:30Z sharp");
        assert_eq!(ctx.event_start, Some(utc(2025, 11, 21, 18, 30)));
    }

    #[test]
    fn test_no_year_stays_absent() {
        // Parsing a date without an explicit year would need "now" to
        // guess; T-ex never reads the clock.
        let ctx = extract("Dinner @ Fri Nov 21 6:30pm", "");
        assert_eq!(ctx.event_start, None);
        assert!(!ctx.has_any_timestamp());
    }

    #[test]
    fn test_invalid_date_skipped() {
        let ctx = extract("Party Feb 30, 2025", "");
        assert_eq!(ctx.event_start, None);
    }

    #[test]
    fn test_plain_text_has_no_context() {
        let ctx = extract("Lunch soon?", "It has been a while");
        assert!(!ctx.has_any_timestamp());
    }

    #[test]
    fn test_delivered_on_claims_delivery_date() {
        let ctx = extract("Your package", "It was delivered on Nov 9, 2025");
        assert_eq!(ctx.delivery_date, Some(utc(2025, 11, 9, 0, 0)));
        assert_eq!(ctx.event_start, None, "claimed dates do not leak into event time");
    }

    #[test]
    fn test_expires_claims_expiration_date() {
        let ctx = extract("Your points expire", "expires on Dec 31, 2025");
        assert_eq!(ctx.expiration_date, Some(utc(2025, 12, 31, 0, 0)));
    }

    #[test]
    fn test_order_placed_claims_purchase_date() {
        let ctx = extract("Order confirmation", "Order placed Nov 8, 2025. Thanks!");
        assert_eq!(ctx.purchase_date, Some(utc(2025, 11, 8, 0, 0)));
    }

    #[test]
    fn test_event_range_two_datetimes() {
        let ctx = extract(
            "Offsite",
            "Runs from Nov 21, 2025 9am to Nov 21, 2025 5pm in the big room",
        );
        assert_eq!(ctx.event_start, Some(utc(2025, 11, 21, 9, 0)));
        assert_eq!(ctx.event_end, Some(utc(2025, 11, 21, 17, 0)));
    }

    #[test]
    fn test_event_range_bare_end_time() {
        let ctx = extract("Dinner @ Nov 21, 2025 6:30pm - 8:30pm", "");
        assert_eq!(ctx.event_start, Some(utc(2025, 11, 21, 18, 30)));
        assert_eq!(ctx.event_end, Some(utc(2025, 11, 21, 20, 30)));
    }

    #[test]
    fn test_end_before_start_dropped() {
        let ctx = extract("Window 2025-11-21 18:00", "ended 2025-11-20 09:00");
        assert_eq!(ctx.event_start, Some(utc(2025, 11, 21, 18, 0)));
        assert_eq!(ctx.event_end, None);
    }

    #[test]
    fn test_mixed_delivery_and_event() {
        let ctx = extract(
            "Arriving soon",
            "delivery expected for Nov 12, 2025. Setup call Nov 14, 2025 3pm.",
        );
        assert_eq!(ctx.delivery_date, Some(utc(2025, 11, 12, 0, 0)));
        assert_eq!(ctx.event_start, Some(utc(2025, 11, 14, 15, 0)));
    }

    #[test]
    fn test_noon_and_midnight_meridiem() {
        let ctx = extract("Lunch Nov 21, 2025 12pm", "");
        assert_eq!(ctx.event_start, Some(utc(2025, 11, 21, 12, 0)));
        let ctx = extract("Launch Nov 21, 2025 12am", "");
        assert_eq!(ctx.event_start, Some(utc(2025, 11, 21, 0, 0)));
    }
}
