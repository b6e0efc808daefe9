//! Queries for the `user_profiles` table.
//!
//! The orchestration core never interprets the payload; it is stored and
//! returned as opaque JSON.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// Fetch the profile payload for a user, if one is stored.
pub async fn get_profile(pool: &PgPool, user_id: Uuid) -> Result<Option<Value>> {
    let payload: Option<(Value,)> =
        sqlx::query_as("SELECT payload FROM user_profiles WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch user profile")?;

    Ok(payload.map(|(p,)| p))
}

/// Insert or replace the profile payload for a user.
pub async fn upsert_profile(pool: &PgPool, user_id: Uuid, payload: &Value) -> Result<()> {
    sqlx::query(
        "INSERT INTO user_profiles (user_id, payload, updated_at)
         VALUES ($1, $2, now())
         ON CONFLICT (user_id)
         DO UPDATE SET payload = EXCLUDED.payload, updated_at = now()",
    )
    .bind(user_id)
    .bind(payload)
    .execute(pool)
    .await
    .context("failed to upsert user profile")?;

    Ok(())
}
