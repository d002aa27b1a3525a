use chrono::{DateTime, FixedOffset, NaiveDate};
use chrono_english::{parse_date_string, Dialect};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::llm::MinuteAdjudicator;

/// A resolved instant this close to "now" usually means the user typed a
/// relative-offset phrase ("in 20 minutes"), which the product disallows as
/// ambiguous.
const GUARD_WINDOW_MINUTES: i64 = 180;

static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+\s*(mins?|minutes?|hours?|hrs?)\b|\bhalf\s+hour\b|\bquarter\s+hour\b)")
        .expect("regex")
});

static FUZZY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\b(later|someday|evening|morning)\b|\dish\b|\bish\b)").expect("regex"));

static DURATION_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d+)\s*(mins?|minutes?|hours?|hrs?)$").expect("regex"));

/// Trim, strip surrounding quote characters, and collapse non-breaking or
/// repeated whitespace. Chat clients smuggle all three in pasted text.
fn normalize_time_text(raw: &str) -> String {
    let t = raw
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '\u{201c}' | '\u{201d}' | '\u{2018}' | '\u{2019}'));

    let mut out = String::with_capacity(t.len());
    let mut last_space = false;
    for ch in t.chars() {
        let ch = if ch == '\u{a0}' { ' ' } else { ch };
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim().to_string()
}

/// Deterministic acceptance rules for a clock-time slot reply, checked before
/// any model is consulted. `date` is the collected (or today's) calendar date
/// the time belongs to.
pub fn validate_clock_time(now: DateTime<FixedOffset>, date: &str, raw_time: &str) -> bool {
    if date.trim().is_empty() || raw_time.trim().is_empty() {
        return false;
    }

    let time = normalize_time_text(raw_time);
    if time.is_empty() {
        return false;
    }

    // Durations must never be accepted as clock times.
    if DURATION_RE.is_match(&time) {
        return false;
    }
    if FUZZY_RE.is_match(&time) {
        return false;
    }

    let combined = format!("{} {}", date.trim(), time);
    let Ok(resolved) = parse_date_string(&combined, now, Dialect::Us) else {
        return false;
    };

    // Strictly forward, and outside the guard window.
    resolved.signed_duration_since(now).num_minutes() > GUARD_WINDOW_MINUTES
}

/// Bare integers are minutes; integer+unit converts; anything else is left to
/// the adjudicator.
pub fn parse_duration_minutes(text: &str) -> Option<i64> {
    let t = normalize_time_text(text);
    if let Ok(n) = t.parse::<i64>() {
        return (n > 0).then_some(n);
    }
    let cap = DURATION_VALUE_RE.captures(&t)?;
    let n: i64 = cap[1].parse().ok()?;
    if n <= 0 {
        return None;
    }
    let unit = cap[2].to_ascii_lowercase();
    if unit.starts_with('h') {
        Some(n * 60)
    } else {
        Some(n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationCheck {
    Valid(i64),
    Unclear,
}

pub async fn validate_duration(text: &str, adjudicator: &dyn MinuteAdjudicator) -> DurationCheck {
    if let Some(minutes) = parse_duration_minutes(text) {
        return DurationCheck::Valid(minutes);
    }
    match adjudicator.adjudicate_minutes(text).await {
        Ok(Some(minutes)) => DurationCheck::Valid(minutes),
        Ok(None) => DurationCheck::Unclear,
        Err(err) => {
            warn!(error = %err, "duration adjudication failed");
            DurationCheck::Unclear
        }
    }
}

/// Normalize a human date phrase to a calendar date, rejecting anything that
/// resolves to a day strictly before today.
pub fn validate_future_date(now: DateTime<FixedOffset>, text: &str) -> Option<NaiveDate> {
    let t = normalize_time_text(text);
    if t.is_empty() {
        return None;
    }
    let resolved = parse_date_string(&t, now, Dialect::Us).ok()?;
    let date = resolved.date_naive();
    if date < now.date_naive() {
        return None;
    }
    Some(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn now() -> DateTime<FixedOffset> {
        // Wednesday 2025-05-07, 09:00 local.
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2025, 5, 7, 9, 0, 0)
            .unwrap()
    }

    struct FixedAdjudicator(Option<i64>);

    #[async_trait]
    impl MinuteAdjudicator for FixedAdjudicator {
        async fn adjudicate_minutes(&self, _text: &str) -> anyhow::Result<Option<i64>> {
            Ok(self.0)
        }
    }

    struct FailingAdjudicator;

    #[async_trait]
    impl MinuteAdjudicator for FailingAdjudicator {
        async fn adjudicate_minutes(&self, _text: &str) -> anyhow::Result<Option<i64>> {
            anyhow::bail!("collaborator down")
        }
    }

    #[test]
    fn rejects_empty_inputs() {
        assert!(!validate_clock_time(now(), "", "8:00 PM"));
        assert!(!validate_clock_time(now(), "2025-05-07", ""));
        assert!(!validate_clock_time(now(), "2025-05-07", "  \"\"  "));
    }

    #[test]
    fn rejects_duration_misfiled_as_time() {
        assert!(!validate_clock_time(now(), "2025-05-07", "10 mins"));
        assert!(!validate_clock_time(now(), "2025-05-07", "2 hours"));
        assert!(!validate_clock_time(now(), "2025-05-07", "half hour"));
        assert!(!validate_clock_time(now(), "2025-05-07", "quarter hour"));
    }

    #[test]
    fn rejects_fuzzy_phrases() {
        assert!(!validate_clock_time(now(), "2025-05-07", "in the morning"));
        assert!(!validate_clock_time(now(), "2025-05-07", "8ish"));
        assert!(!validate_clock_time(now(), "2025-05-07", "later"));
        assert!(!validate_clock_time(now(), "2025-05-07", "someday"));
    }

    #[test]
    fn rejects_guard_window_results() {
        // 09:15 resolves 15 minutes out: a relative-offset phrase in disguise.
        assert!(!validate_clock_time(now(), "2025-05-07", "9:15 AM"));
        // Exactly at the window edge is still rejected.
        assert!(!validate_clock_time(now(), "2025-05-07", "12:00 PM"));
    }

    #[test]
    fn rejects_past_instants() {
        assert!(!validate_clock_time(now(), "2025-05-07", "7:00 AM"));
    }

    #[test]
    fn accepts_genuine_clock_times() {
        assert!(validate_clock_time(now(), "2025-05-07", "8:00 PM"));
        assert!(validate_clock_time(now(), "2025-05-08", "10:00 AM"));
    }

    #[test]
    fn normalizes_quotes_and_odd_spaces() {
        assert!(validate_clock_time(now(), "2025-05-07", "\u{201c}8:00\u{a0}\u{a0}PM\u{201d}"));
        assert!(validate_clock_time(now(), "2025-05-07", "  '8:00 PM'  "));
    }

    #[test]
    fn duration_grammar_accepts_integers_and_units() {
        assert_eq!(parse_duration_minutes("45"), Some(45));
        assert_eq!(parse_duration_minutes("45 mins"), Some(45));
        assert_eq!(parse_duration_minutes("45mins"), Some(45));
        assert_eq!(parse_duration_minutes("1 hour"), Some(60));
        assert_eq!(parse_duration_minutes("2 hrs"), Some(120));
        assert_eq!(parse_duration_minutes("soon"), None);
        assert_eq!(parse_duration_minutes("0"), None);
    }

    #[tokio::test]
    async fn unclear_duration_defers_to_adjudicator() {
        assert_eq!(
            validate_duration("soon", &FixedAdjudicator(None)).await,
            DurationCheck::Unclear
        );
        assert_eq!(
            validate_duration("soon", &FixedAdjudicator(Some(30))).await,
            DurationCheck::Valid(30)
        );
        // Deterministic grammar wins without consulting the model.
        assert_eq!(
            validate_duration("45 mins", &FixedAdjudicator(None)).await,
            DurationCheck::Valid(45)
        );
    }

    #[tokio::test]
    async fn adjudicator_failure_is_unclear_not_fatal() {
        assert_eq!(
            validate_duration("a while", &FailingAdjudicator).await,
            DurationCheck::Unclear
        );
    }

    #[test]
    fn future_date_normalizes_and_rejects_past() {
        assert_eq!(
            validate_future_date(now(), "tomorrow"),
            NaiveDate::from_ymd_opt(2025, 5, 8)
        );
        assert_eq!(
            validate_future_date(now(), "2025-06-01"),
            NaiveDate::from_ymd_opt(2025, 6, 1)
        );
        assert_eq!(validate_future_date(now(), "2025-05-01"), None);
        assert_eq!(validate_future_date(now(), "yesterday"), None);
        assert_eq!(validate_future_date(now(), "blorp"), None);
    }
}
