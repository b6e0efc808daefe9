//! Database query functions for the `generation_metrics` table.
//!
//! Samples are append-only and read only in aggregate, to predict how long
//! the next generation for a given (user, operation kind) will take.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

/// How many recent successful samples feed the duration estimate.
const ESTIMATE_SAMPLE_LIMIT: i64 = 20;

/// Append a duration sample for a finished generation run.
pub async fn record_sample(
    pool: &PgPool,
    user_id: Uuid,
    operation_kind: &str,
    duration_ms: i64,
    success: bool,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO generation_metrics (user_id, operation_kind, duration_ms, success) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(user_id)
    .bind(operation_kind)
    .bind(duration_ms)
    .bind(success)
    .execute(pool)
    .await
    .context("failed to record metrics sample")?;

    Ok(())
}

/// Estimate the duration of the next run for `(user_id, operation_kind)`.
///
/// Takes a trimmed mean over the most recent successful samples: with four
/// or more samples the minimum and maximum are dropped before averaging,
/// otherwise a plain mean is used. Returns `None` when no successful samples
/// exist -- callers omit the ETA rather than reporting zero.
pub async fn estimate_duration_ms(
    pool: &PgPool,
    user_id: Uuid,
    operation_kind: &str,
) -> Result<Option<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT duration_ms FROM generation_metrics \
         WHERE user_id = $1 AND operation_kind = $2 AND success \
         ORDER BY recorded_at DESC \
         LIMIT $3",
    )
    .bind(user_id)
    .bind(operation_kind)
    .bind(ESTIMATE_SAMPLE_LIMIT)
    .fetch_all(pool)
    .await
    .context("failed to fetch metrics samples")?;

    let durations: Vec<i64> = rows.into_iter().map(|(d,)| d).collect();
    Ok(trimmed_mean(&durations))
}

/// Trimmed mean: drop one min and one max when there are at least four
/// samples, else a plain mean. `None` for an empty slice.
fn trimmed_mean(durations: &[i64]) -> Option<i64> {
    if durations.is_empty() {
        return None;
    }

    if durations.len() >= 4 {
        let min = *durations.iter().min().expect("non-empty");
        let max = *durations.iter().max().expect("non-empty");
        let mut sum: i64 = durations.iter().sum();
        sum -= min + max;
        let count = durations.len() as i64 - 2;
        Some(sum / count)
    } else {
        let sum: i64 = durations.iter().sum();
        Some(sum / durations.len() as i64)
    }
}
