use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a generation request.
///
/// `Completed` and `Failed` are terminal and sticky: once a row reaches one
/// of them, no later write may change the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RequestStatus {
    /// Whether this status is terminal (`completed` or `failed`).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for RequestStatus {
    type Err = RequestStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(RequestStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RequestStatus`] string.
#[derive(Debug, Clone)]
pub struct RequestStatusParseError(pub String);

impl fmt::Display for RequestStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid request status: {:?}", self.0)
    }
}

impl std::error::Error for RequestStatusParseError {}

// ---------------------------------------------------------------------------

/// What kind of artifact a request generates.
///
/// The orchestration core treats the request context as opaque beyond this
/// tag and the optional target day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    Plan,
    Split,
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Split => "split",
        };
        f.write_str(s)
    }
}

impl FromStr for GenerationKind {
    type Err = GenerationKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "split" => Ok(Self::Split),
            other => Err(GenerationKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`GenerationKind`] string.
#[derive(Debug, Clone)]
pub struct GenerationKindParseError(pub String);

impl fmt::Display for GenerationKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid generation kind: {:?}", self.0)
    }
}

impl std::error::Error for GenerationKindParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A generation request -- the ledger's unit of record.
///
/// `id` is the client-supplied idempotency key. At most one request per user
/// may be non-terminal at a time; the orchestrator enforces this via
/// [`crate::queries::requests::get_active_for_user`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: GenerationKind,
    pub target_day: Option<i32>,
    pub status: RequestStatus,
    pub progress_percent: i32,
    pub current_phase: Option<String>,
    pub result_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationRequest {
    /// Age of the row since its last mutation.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }
}

/// A recorded duration sample for a past generation run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MetricsSample {
    pub id: i64,
    pub user_id: Uuid,
    pub operation_kind: String,
    pub duration_ms: i64,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_status_display_roundtrip() {
        let variants = [
            RequestStatus::Pending,
            RequestStatus::InProgress,
            RequestStatus::Completed,
            RequestStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RequestStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn request_status_invalid() {
        let result = "bogus".parse::<RequestStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::InProgress.is_terminal());
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
    }

    #[test]
    fn generation_kind_display_roundtrip() {
        let variants = [GenerationKind::Plan, GenerationKind::Split];
        for v in &variants {
            let s = v.to_string();
            let parsed: GenerationKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn generation_kind_invalid() {
        let result = "mesocycle".parse::<GenerationKind>();
        assert!(result.is_err());
    }

    #[test]
    fn request_age() {
        let now = Utc::now();
        let req = GenerationRequest {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kind: GenerationKind::Plan,
            target_day: Some(3),
            status: RequestStatus::Pending,
            progress_percent: 0,
            current_phase: None,
            result_ref: None,
            error_message: None,
            created_at: now - chrono::Duration::seconds(90),
            updated_at: now - chrono::Duration::seconds(30),
        };
        assert_eq!(req.age(now), chrono::Duration::seconds(30));
    }
}
