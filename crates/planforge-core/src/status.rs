//! The polling read path: cache first, ledger fallback, no side effects.
//!
//! Shared by the HTTP status endpoint and the CLI `status` command so both
//! speak the same status vocabulary as the stream.

use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use planforge_db::models::RequestStatus;
use planforge_db::queries::requests;

use crate::cache::{CacheStatus, RequestCache};
use crate::orchestrator::OrchestratorConfig;

/// Status of a generation request as seen by a polling client.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusResponse {
    /// Unknown or expired; the caller should start over with a new request.
    NotFound,
    InProgress {
        progress: u8,
        phase: String,
        message: String,
    },
    Complete {
        result_ref: String,
        insight_changes: Value,
    },
    Error {
        error: String,
    },
}

/// Resolve the status of a request.
///
/// Resolution order: cache (cheap, process-local), then ledger
/// (authoritative, survives restarts). Safe to call repeatedly; reads only.
pub async fn get_status(
    pool: &PgPool,
    cache: &RequestCache,
    config: &OrchestratorConfig,
    request_id: Uuid,
) -> anyhow::Result<StatusResponse> {
    if let Some(entry) = cache.get(request_id) {
        match entry.status {
            CacheStatus::Complete => {
                return Ok(StatusResponse::Complete {
                    result_ref: entry.result_ref.unwrap_or_default(),
                    insight_changes: entry.insight_changes,
                });
            }
            CacheStatus::Error => {
                return Ok(StatusResponse::Error {
                    error: entry.error.unwrap_or_else(|| "generation failed".to_owned()),
                });
            }
            CacheStatus::InProgress => {
                // The time-based estimate may run ahead of the last persisted
                // percent, but a poll must never report less than the ledger.
                let ledger_percent = requests::get_request(pool, request_id)
                    .await?
                    .map(|r| r.progress_percent.clamp(0, 100) as u8)
                    .unwrap_or(0);
                let (estimate, phase) = cache
                    .estimate_progress(request_id)
                    .unwrap_or((0, "working"));
                let progress = estimate.max(ledger_percent);
                return Ok(StatusResponse::InProgress {
                    progress,
                    phase: phase.to_owned(),
                    message: "generation in progress".to_owned(),
                });
            }
        }
    }

    // Ledger fallback: the only path that works across instances and
    // process restarts.
    let Some(req) = requests::get_request(pool, request_id).await? else {
        return Ok(StatusResponse::NotFound);
    };

    let expired = req
        .age(chrono::Utc::now())
        .to_std()
        .map(|age| age > config.retention)
        .unwrap_or(false);
    if expired {
        return Ok(StatusResponse::NotFound);
    }

    Ok(match req.status {
        RequestStatus::Completed => StatusResponse::Complete {
            result_ref: req.result_ref.unwrap_or_default(),
            insight_changes: Value::Null,
        },
        RequestStatus::Failed => StatusResponse::Error {
            error: req
                .error_message
                .unwrap_or_else(|| "generation failed".to_owned()),
        },
        RequestStatus::Pending | RequestStatus::InProgress => StatusResponse::InProgress {
            progress: req.progress_percent.clamp(0, 100) as u8,
            phase: req.current_phase.unwrap_or_else(|| "working".to_owned()),
            message: "generation in progress".to_owned(),
        },
    })
}
