//! Section assignment: intrinsic (T0) and decayed (T1).
//!
//! T0 reads only what the message *is* — type, importance, intrinsic
//! timestamps — and is testable without any clock. T1 is the single
//! place `now` enters the digest: an ordered first-match rule table with
//! a mandatory one-hour grace window for client-timezone skew.

use chrono::{DateTime, Duration, Utc};

use crate::types::{Classification, EmailType, Importance, Section, TemporalContext};

/// Intrinsic section (T0). No clock.
pub fn intrinsic_section(classification: &Classification, temporal: &TemporalContext) -> Section {
    // Too short-lived to digest.
    if classification.email_type == EmailType::Otp {
        return Section::Skip;
    }
    match classification.importance {
        Importance::Critical => Section::Critical,
        Importance::TimeSensitive if temporal.has_any_timestamp() => Section::Today,
        _ => Section::EverythingElse,
    }
}

/// Decayed section (T1). First matching rule wins.
pub fn decayed_section(
    t0: Section,
    temporal: &TemporalContext,
    importance: Importance,
    now: DateTime<Utc>,
) -> Section {
    if t0 == Section::Skip {
        return Section::Skip;
    }

    let grace = Duration::hours(1);

    // Non-event critical never demotes.
    let has_event = temporal.event_start.is_some() || temporal.event_end.is_some();
    if t0 == Section::Critical && !has_event {
        return Section::Critical;
    }

    if let Some(start) = temporal.event_start {
        // Over, with grace: end passed more than an hour ago, or an
        // endless event started more than an hour ago.
        match temporal.event_end {
            Some(end) if end < now - grace => return Section::Skip,
            None if start < now - grace => return Section::Skip,
            _ => {}
        }
        let until_start = start - now;
        if until_start.abs() <= grace {
            return Section::Critical;
        }
        if until_start <= Duration::hours(24) {
            return Section::Today;
        }
        if until_start <= Duration::days(7) {
            return Section::ComingUp;
        }
        return Section::WorthKnowing;
    }

    if let Some(delivered) = temporal.delivery_date {
        let age = now - delivered;
        if age >= Duration::zero() && age <= Duration::hours(24) {
            return Section::Today;
        }
        if age > Duration::hours(24) && importance == Importance::Routine {
            return Section::EverythingElse;
        }
    }

    if let Some(purchased) = temporal.purchase_date {
        if purchased < now {
            return Section::EverythingElse;
        }
    }

    t0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Attention, ClientLabel, Decider, Domain, Relationship,
    };
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn classification(email_type: EmailType, importance: Importance) -> Classification {
        Classification {
            message_id: "m1".to_string(),
            email_type,
            type_conf: 0.9,
            domains: Vec::<Domain>::new(),
            domain_conf: BTreeMap::new(),
            attention: Attention::None,
            attention_conf: 0.2,
            importance,
            importance_conf: 0.8,
            relationship: Relationship::FromUnknown,
            client_label: Classification::derive_client_label(email_type, Attention::None),
            decider: Decider::Llm,
            reason: "test".to_string(),
            model_version: "m".to_string(),
            prompt_version: "p".to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 10, 12, 0, 0).unwrap()
    }

    fn event_at(start: DateTime<Utc>) -> TemporalContext {
        TemporalContext { event_start: Some(start), ..Default::default() }
    }

    // ------------------------------------------------------------------
    // T0
    // ------------------------------------------------------------------

    #[test]
    fn test_t0_otp_skips() {
        let c = classification(EmailType::Otp, Importance::Critical);
        assert_eq!(intrinsic_section(&c, &TemporalContext::default()), Section::Skip);
    }

    #[test]
    fn test_t0_critical() {
        let c = classification(EmailType::Notification, Importance::Critical);
        assert_eq!(intrinsic_section(&c, &TemporalContext::default()), Section::Critical);
    }

    #[test]
    fn test_t0_time_sensitive_with_timestamp_is_today() {
        let c = classification(EmailType::Event, Importance::TimeSensitive);
        let t = event_at(now()); // any timestamp; T0 never compares to now
        assert_eq!(intrinsic_section(&c, &t), Section::Today);
    }

    #[test]
    fn test_t0_time_sensitive_without_timestamp_falls_through() {
        let c = classification(EmailType::Event, Importance::TimeSensitive);
        assert_eq!(
            intrinsic_section(&c, &TemporalContext::default()),
            Section::EverythingElse
        );
    }

    #[test]
    fn test_t0_routine_is_everything_else() {
        let c = classification(EmailType::Newsletter, Importance::Routine);
        assert_eq!(
            intrinsic_section(&c, &TemporalContext::default()),
            Section::EverythingElse
        );
    }

    // ------------------------------------------------------------------
    // T1: event decay
    // ------------------------------------------------------------------

    #[test]
    fn test_t1_event_eleven_days_out_is_worth_knowing() {
        // Dinner Nov 21 6:30pm seen on Nov 10: 11 days > 7d.
        let start = Utc.with_ymd_and_hms(2025, 11, 21, 18, 30, 0).unwrap();
        let section =
            decayed_section(Section::Today, &event_at(start), Importance::TimeSensitive, now());
        assert_eq!(section, Section::WorthKnowing);
    }

    #[test]
    fn test_t1_event_next_day_is_coming_up() {
        // Same dinner seen on Nov 20 noon: ~30 hours ahead.
        let start = Utc.with_ymd_and_hms(2025, 11, 21, 18, 30, 0).unwrap();
        let at = Utc.with_ymd_and_hms(2025, 11, 20, 12, 0, 0).unwrap();
        let section =
            decayed_section(Section::Today, &event_at(start), Importance::TimeSensitive, at);
        assert_eq!(section, Section::ComingUp);
    }

    #[test]
    fn test_t1_event_within_hour_is_critical() {
        // Same dinner at 6pm the day of: 30 minutes ahead.
        let start = Utc.with_ymd_and_hms(2025, 11, 21, 18, 30, 0).unwrap();
        let at = Utc.with_ymd_and_hms(2025, 11, 21, 18, 0, 0).unwrap();
        let section =
            decayed_section(Section::Today, &event_at(start), Importance::TimeSensitive, at);
        assert_eq!(section, Section::Critical);
    }

    #[test]
    fn test_t1_grace_keeps_recent_start_critical() {
        // Started 30 minutes ago, no end: inside the ±1h window, not skipped.
        let start = now() - Duration::minutes(30);
        let section =
            decayed_section(Section::Today, &event_at(start), Importance::TimeSensitive, now());
        assert_eq!(section, Section::Critical);
    }

    #[test]
    fn test_t1_endless_event_past_grace_skips() {
        let start = now() - Duration::hours(2);
        let section =
            decayed_section(Section::Today, &event_at(start), Importance::TimeSensitive, now());
        assert_eq!(section, Section::Skip);
    }

    #[test]
    fn test_t1_ended_event_past_grace_skips() {
        let t = TemporalContext {
            event_start: Some(now() - Duration::hours(5)),
            event_end: Some(now() - Duration::hours(2)),
            ..Default::default()
        };
        assert_eq!(
            decayed_section(Section::Today, &t, Importance::TimeSensitive, now()),
            Section::Skip
        );
    }

    #[test]
    fn test_t1_in_progress_event_not_skipped() {
        // Started 3h ago but the end is still ahead: the grace applies to
        // the end when one exists.
        let t = TemporalContext {
            event_start: Some(now() - Duration::hours(3)),
            event_end: Some(now() + Duration::hours(1)),
            ..Default::default()
        };
        let section = decayed_section(Section::Today, &t, Importance::TimeSensitive, now());
        assert_ne!(section, Section::Skip);
    }

    #[test]
    fn test_t1_boundary_exactly_seven_days_is_coming_up() {
        let start = now() + Duration::days(7);
        let section =
            decayed_section(Section::Today, &event_at(start), Importance::TimeSensitive, now());
        assert_eq!(section, Section::ComingUp);
        // One second past the boundary demotes.
        let just_past = now() + Duration::days(7) + Duration::seconds(1);
        let section =
            decayed_section(Section::Today, &event_at(just_past), Importance::TimeSensitive, now());
        assert_eq!(section, Section::WorthKnowing);
    }

    #[test]
    fn test_t1_boundary_exactly_24h_is_today() {
        let start = now() + Duration::hours(24);
        let section =
            decayed_section(Section::Today, &event_at(start), Importance::TimeSensitive, now());
        assert_eq!(section, Section::Today);
    }

    // ------------------------------------------------------------------
    // T1: non-event rows
    // ------------------------------------------------------------------

    #[test]
    fn test_t1_critical_non_event_never_demotes() {
        let t = TemporalContext {
            purchase_date: Some(now() - Duration::days(30)),
            ..Default::default()
        };
        assert_eq!(
            decayed_section(Section::Critical, &t, Importance::Critical, now()),
            Section::Critical
        );
    }

    #[test]
    fn test_t1_recent_delivery_is_today() {
        let t = TemporalContext {
            delivery_date: Some(now() - Duration::hours(5)),
            ..Default::default()
        };
        assert_eq!(
            decayed_section(Section::EverythingElse, &t, Importance::Routine, now()),
            Section::Today
        );
    }

    #[test]
    fn test_t1_stale_routine_delivery_is_everything_else() {
        let t = TemporalContext {
            delivery_date: Some(now() - Duration::days(3)),
            ..Default::default()
        };
        assert_eq!(
            decayed_section(Section::Today, &t, Importance::Routine, now()),
            Section::EverythingElse
        );
    }

    #[test]
    fn test_t1_past_purchase_is_everything_else() {
        let t = TemporalContext {
            purchase_date: Some(now() - Duration::days(1)),
            ..Default::default()
        };
        assert_eq!(
            decayed_section(Section::Today, &t, Importance::Routine, now()),
            Section::EverythingElse
        );
    }

    #[test]
    fn test_t1_default_keeps_t0() {
        assert_eq!(
            decayed_section(
                Section::EverythingElse,
                &TemporalContext::default(),
                Importance::Routine,
                now()
            ),
            Section::EverythingElse
        );
        assert_eq!(
            decayed_section(Section::Skip, &TemporalContext::default(), Importance::Critical, now()),
            Section::Skip
        );
    }
}
