//! Enrichment: resolved importance, relative-time labels in the user's
//! timezone, the greeting, and deep links.

use chrono::{DateTime, Datelike, Duration, Utc};
use chrono_tz::Tz;

use crate::digest::links::LinkBuilder;
use crate::types::{EnrichedEntity, Entity, Importance, Section};

/// Optional collaborator for the greeting line (weather, location). When
/// absent, the static greeting is used.
pub trait GreetingSource: Send + Sync {
    fn greeting(&self, now_local: DateTime<Tz>) -> Option<String>;
}

/// Deterministic fallback greeting by local hour.
pub fn static_greeting(now: DateTime<Utc>, tz: Tz) -> String {
    let local = now.with_timezone(&tz);
    let hour = chrono::Timelike::hour(&local);
    let salutation = match hour {
        5..=11 => "Good morning",
        12..=17 => "Good afternoon",
        _ => "Good evening",
    };
    format!("{}. Here is your inbox.", salutation)
}

/// Importance after decay: the section the entity landed in wins over
/// what the message intrinsically claimed.
pub fn resolved_importance(section: Section, intrinsic: Importance) -> Importance {
    match section {
        Section::Critical => Importance::Critical,
        Section::Today | Section::ComingUp => Importance::TimeSensitive,
        _ => intrinsic,
    }
}

/// Human label for an event time, relative to `now`, in the user's
/// timezone. Deterministic for a fixed `(event_time, now, tz)`.
pub fn when_label(event_time: DateTime<Utc>, now: DateTime<Utc>, tz: Tz) -> String {
    let delta = event_time - now;
    let local = event_time.with_timezone(&tz);
    let now_local = now.with_timezone(&tz);

    if delta < Duration::zero() {
        let past = -delta;
        if past < Duration::hours(1) {
            return format!("{} minutes ago", past.num_minutes().max(1));
        }
        if past < Duration::hours(24) {
            return format!("{} hours ago", past.num_hours());
        }
        return local.format("%b %-d").to_string();
    }

    if delta < Duration::minutes(60) {
        return format!("in {} minutes", delta.num_minutes().max(1));
    }
    if delta < Duration::hours(6) {
        return format!("in {} hours", delta.num_hours());
    }
    if local.date_naive() == now_local.date_naive() {
        return format!("today {}", format_clock(&local));
    }
    if local.date_naive() == now_local.date_naive().succ_opt().unwrap_or(local.date_naive()) {
        return format!("tomorrow {}", format_clock(&local));
    }
    if delta <= Duration::days(7) {
        return format!("{} {}", local.format("%a"), format_clock(&local));
    }
    format!("{} {}", local.format("%b"), local.day())
}

fn format_clock(local: &DateTime<Tz>) -> String {
    // "6:30pm" / "9am" — drop the minutes when they are zero.
    let formatted = if chrono::Timelike::minute(local) == 0 {
        local.format("%-I%P").to_string()
    } else {
        local.format("%-I:%M%P").to_string()
    };
    formatted
}

/// Wrap one entity with everything the renderer needs.
pub fn enrich_entity(
    entity: Entity,
    section: Section,
    user_id: &str,
    now: DateTime<Utc>,
    tz: Tz,
    links: &LinkBuilder,
) -> EnrichedEntity {
    let when = entity.core.event_time.map(|t| when_label(t, now, tz));
    let link = links.message_link(user_id, &entity.core.source_message_id);
    let intrinsic = entity.core.importance;
    EnrichedEntity {
        entity,
        resolved_importance: resolved_importance(section, intrinsic),
        digest_section: section,
        when_label: when,
        link,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_when_label_minutes() {
        let t = now() + Duration::minutes(30);
        assert_eq!(when_label(t, now(), chrono_tz::UTC), "in 30 minutes");
    }

    #[test]
    fn test_when_label_hours() {
        let t = now() + Duration::hours(3);
        assert_eq!(when_label(t, now(), chrono_tz::UTC), "in 3 hours");
    }

    #[test]
    fn test_when_label_tomorrow_in_timezone() {
        // 2025-11-11 23:30 UTC is tomorrow 6:30pm in New York.
        let t = Utc.with_ymd_and_hms(2025, 11, 11, 23, 30, 0).unwrap();
        let label = when_label(t, now(), chrono_tz::America::New_York);
        assert_eq!(label, "tomorrow 6:30pm");
    }

    #[test]
    fn test_when_label_weekday_within_week() {
        let t = Utc.with_ymd_and_hms(2025, 11, 14, 18, 0, 0).unwrap(); // Friday
        let label = when_label(t, now(), chrono_tz::UTC);
        assert_eq!(label, "Fri 6pm");
    }

    #[test]
    fn test_when_label_beyond_week_is_date() {
        let t = Utc.with_ymd_and_hms(2025, 11, 21, 18, 30, 0).unwrap();
        assert_eq!(when_label(t, now(), chrono_tz::UTC), "Nov 21");
    }

    #[test]
    fn test_when_label_past() {
        let t = now() - Duration::minutes(20);
        assert_eq!(when_label(t, now(), chrono_tz::UTC), "20 minutes ago");
    }

    #[test]
    fn test_when_label_is_deterministic() {
        let t = now() + Duration::hours(30);
        let a = when_label(t, now(), chrono_tz::America::Los_Angeles);
        let b = when_label(t, now(), chrono_tz::America::Los_Angeles);
        assert_eq!(a, b);
    }

    #[test]
    fn test_static_greeting_by_local_hour() {
        // 12:00 UTC is 7am in New York: morning.
        let g = static_greeting(now(), chrono_tz::America::New_York);
        assert!(g.starts_with("Good morning"));
        // Same instant in UTC is afternoon.
        let g = static_greeting(now(), chrono_tz::UTC);
        assert!(g.starts_with("Good afternoon"));
    }

    #[test]
    fn test_resolved_importance_mirrors_section() {
        assert_eq!(
            resolved_importance(Section::Critical, Importance::Routine),
            Importance::Critical
        );
        assert_eq!(
            resolved_importance(Section::ComingUp, Importance::Routine),
            Importance::TimeSensitive
        );
        assert_eq!(
            resolved_importance(Section::EverythingElse, Importance::Routine),
            Importance::Routine
        );
    }
}
