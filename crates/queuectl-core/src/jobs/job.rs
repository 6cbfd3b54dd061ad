//! Job types and definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller-supplied job identifier. Opaque, globally unique, not a UUID the
/// engine generates itself — the wire format requires callers to supply it.
pub type JobId = String;

/// The six states a job can occupy. `pending`/`scheduled`/`failed` are
/// leasable (subject to `run_at`); `processing` is held by exactly one
/// worker; `completed`/`dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Scheduled,
    Processing,
    Failed,
    Completed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Scheduled => "scheduled",
            JobState::Processing => "processing",
            JobState::Failed => "failed",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "scheduled" => Some(JobState::Scheduled),
            "processing" => Some(JobState::Processing),
            "failed" => Some(JobState::Failed),
            "completed" => Some(JobState::Completed),
            "dead" => Some(JobState::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A job row as persisted by the Store. Fields mirror §3 of the job queue
/// contract exactly; there is no derived state kept anywhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub priority: i64,
    pub timeout: i64,
    pub run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// True once `attempts` has reached the retry budget — the row must be
    /// in `dead` by the time this is true, never observed otherwise.
    pub fn is_retry_budget_exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }
}

/// Fields a caller may supply on `enqueue`; anything omitted falls back to
/// config or a hardcoded default per §4.2.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnqueueOptions {
    pub max_retries: Option<i64>,
    pub run_at: Option<String>,
    #[serde(default)]
    pub priority: i64,
    pub timeout: Option<i64>,
}

/// The enqueue wire format (§6): required `id`/`command`, everything else
/// optional and folded into [`EnqueueOptions`]. Unknown fields are ignored
/// by `serde`'s default (non-`deny_unknown_fields`) behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub id: JobId,
    pub command: String,
    #[serde(flatten)]
    pub opts: EnqueueOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_str() {
        for s in [
            JobState::Pending,
            JobState::Scheduled,
            JobState::Processing,
            JobState::Failed,
            JobState::Completed,
            JobState::Dead,
        ] {
            assert_eq!(JobState::from_str(s.as_str()), Some(s));
        }
    }

    #[test]
    fn unknown_state_string_is_none() {
        assert_eq!(JobState::from_str("bogus"), None);
    }

    #[test]
    fn enqueue_request_parses_minimal_json() {
        let req: EnqueueRequest =
            serde_json::from_str(r#"{"id":"a","command":"exit 0"}"#).unwrap();
        assert_eq!(req.id, "a");
        assert_eq!(req.command, "exit 0");
        assert_eq!(req.opts.priority, 0);
        assert!(req.opts.max_retries.is_none());
    }

    #[test]
    fn enqueue_request_ignores_unknown_fields() {
        let req: EnqueueRequest =
            serde_json::from_str(r#"{"id":"a","command":"x","bogus":true}"#).unwrap();
        assert_eq!(req.id, "a");
    }
}
