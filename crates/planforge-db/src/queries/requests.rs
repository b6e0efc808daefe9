//! Database query functions for the `generation_requests` table.
//!
//! Mutations are safe under concurrent callers for the same request ID: each
//! UPDATE carries a status guard in its WHERE clause, so a late writer that
//! loses a race affects zero rows instead of clobbering state. Terminal
//! transitions are sticky -- the first terminal write wins.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{GenerationKind, GenerationRequest};

/// Insert a new request row in `pending` status.
///
/// The id is the client-supplied idempotency key; inserting an id that
/// already exists fails with a unique violation (see [`is_unique_violation`]).
pub async fn insert_request(
    pool: &PgPool,
    id: Uuid,
    user_id: Uuid,
    kind: GenerationKind,
    target_day: Option<i32>,
) -> Result<GenerationRequest> {
    let request = sqlx::query_as::<_, GenerationRequest>(
        "INSERT INTO generation_requests (id, user_id, kind, target_day) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(id)
    .bind(user_id)
    .bind(kind)
    .bind(target_day)
    .fetch_one(pool)
    .await
    .context("failed to insert generation request")?;

    Ok(request)
}

/// Fetch a request by its idempotency key.
pub async fn get_request(pool: &PgPool, id: Uuid) -> Result<Option<GenerationRequest>> {
    let request =
        sqlx::query_as::<_, GenerationRequest>("SELECT * FROM generation_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch generation request")?;

    Ok(request)
}

/// Fetch the most recent non-terminal request for a user, if any.
///
/// This is the dedup query: the orchestrator consults it before starting
/// new work to enforce at most one active generation per user.
pub async fn get_active_for_user(pool: &PgPool, user_id: Uuid) -> Result<Option<GenerationRequest>> {
    let request = sqlx::query_as::<_, GenerationRequest>(
        "SELECT * FROM generation_requests \
         WHERE user_id = $1 AND status IN ('pending', 'in_progress') \
         ORDER BY created_at DESC \
         LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch active request for user")?;

    Ok(request)
}

/// Record a progress update.
///
/// A no-op (not an error) when the row is already terminal: late updates
/// after completion must not resurrect a finished request. The persisted
/// percentage never regresses (`GREATEST`), so concurrent writers cannot
/// make a poll observe a lower value than previously stored.
pub async fn update_progress(pool: &PgPool, id: Uuid, percent: i32, phase: &str) -> Result<()> {
    sqlx::query(
        "UPDATE generation_requests \
         SET progress_percent = GREATEST(progress_percent, $2), \
             current_phase = $3, \
             updated_at = now() \
         WHERE id = $1 AND status IN ('pending', 'in_progress')",
    )
    .bind(id)
    .bind(percent.clamp(0, 100))
    .bind(phase)
    .execute(pool)
    .await
    .context("failed to update request progress")?;

    Ok(())
}

/// Transition a request from `pending` to `in_progress`.
///
/// Zero rows affected is tolerated: another caller (a reconnecting stream,
/// an out-of-process worker) already started the same request.
pub async fn mark_started(pool: &PgPool, id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE generation_requests \
         SET status = 'in_progress', updated_at = now() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark request started")?;

    if result.rows_affected() == 0 {
        tracing::debug!(request_id = %id, "mark_started affected no rows (already started or terminal)");
    }

    Ok(())
}

/// Write the `completed` terminal state.
///
/// Returns `true` if this call performed the transition, `false` if the row
/// was already terminal (the write is ignored -- first terminal write wins).
pub async fn mark_completed(pool: &PgPool, id: Uuid, result_ref: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE generation_requests \
         SET status = 'completed', \
             result_ref = $2, \
             progress_percent = 100, \
             current_phase = 'complete', \
             updated_at = now() \
         WHERE id = $1 AND status NOT IN ('completed', 'failed')",
    )
    .bind(id)
    .bind(result_ref)
    .execute(pool)
    .await
    .context("failed to mark request completed")?;

    Ok(result.rows_affected() > 0)
}

/// Write the `failed` terminal state with a classified error message.
///
/// Returns `true` if this call performed the transition, `false` if the row
/// was already terminal.
pub async fn mark_failed(pool: &PgPool, id: Uuid, message: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE generation_requests \
         SET status = 'failed', \
             error_message = $2, \
             current_phase = 'error', \
             updated_at = now() \
         WHERE id = $1 AND status NOT IN ('completed', 'failed')",
    )
    .bind(id)
    .bind(message)
    .execute(pool)
    .await
    .context("failed to mark request failed")?;

    Ok(result.rows_affected() > 0)
}

/// Whether an error from [`insert_request`] is a primary-key collision,
/// i.e. another caller inserted the same request ID first.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}
