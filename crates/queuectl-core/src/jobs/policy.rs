//! Pure failure-policy functions. No I/O, no clock reads beyond the `now`
//! passed in by the caller — these are the functions the Store calls inside
//! its transactions, kept free-standing so they can be tested without a
//! database.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use tracing::warn;

/// `base ** attempts` seconds, where `attempts` is the count *after*
/// increment (i.e. `new_attempts`).
pub fn next_delay_secs(new_attempts: i64, base: i64) -> i64 {
    base.saturating_pow(new_attempts.max(0) as u32)
}

/// Whether a failed attempt has exhausted the retry budget.
pub fn is_terminal(new_attempts: i64, max_retries: i64) -> bool {
    new_attempts >= max_retries
}

/// `now + nextDelay(new_attempts, base)`.
pub fn resolve_run_at(now: DateTime<Utc>, base: i64, new_attempts: i64) -> DateTime<Utc> {
    now + chrono::Duration::seconds(next_delay_secs(new_attempts, base))
}

/// Parses the `backoff_base` config value, falling back to 2 (and logging a
/// warning) on anything that doesn't parse as a positive integer.
pub fn parse_backoff_base(raw: &str) -> i64 {
    match raw.parse::<i64>() {
        Ok(n) if n > 0 => n,
        _ => {
            warn!(value = raw, "invalid backoff_base, defaulting to 2");
            2
        }
    }
}

/// Parses the `max_retries` config value, falling back to 3 on anything
/// that doesn't parse as a positive integer.
pub fn parse_max_retries(raw: &str) -> i64 {
    match raw.parse::<i64>() {
        Ok(n) if n > 0 => n,
        _ => {
            warn!(value = raw, "invalid max_retries, defaulting to 3");
            3
        }
    }
}

/// Error returned by [`parse_run_at`] for a string that is neither a valid
/// ISO-8601 instant nor empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAtParseError(pub String);

impl std::fmt::Display for RunAtParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid run_at: {}", self.0)
    }
}

/// Accepts ISO-8601. An offset-less timestamp is attached to `local_tz`
/// before conversion to UTC. If the resulting instant is `<= now`, returns
/// `Ok(None)` (interpreted as "run now" — stays `pending`, not `scheduled`).
/// Otherwise returns the UTC instant. Anything unparseable is an error.
pub fn parse_run_at(
    raw: &str,
    now: DateTime<Utc>,
    local_tz: FixedOffset,
) -> Result<Option<DateTime<Utc>>, RunAtParseError> {
    let instant = if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        dt.with_timezone(&Utc)
    } else {
        let naive = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
            .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
            .map_err(|_| RunAtParseError(raw.to_string()))?;
        let local = local_tz
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| RunAtParseError(raw.to_string()))?;
        local.with_timezone(&Utc)
    };

    if instant <= now {
        Ok(None)
    } else {
        Ok(Some(instant))
    }
}
