//! Tests that the embedded migrations produce the expected schema and can be
//! re-applied idempotently.

use planforge_db::pool;
use planforge_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn migrations_create_expected_tables() {
    let (pool, db_name) = create_test_db().await;

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' \
         ORDER BY tablename",
    )
    .fetch_all(&pool)
    .await
    .expect("should list tables");

    let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
    assert!(names.contains(&"generation_requests"), "tables: {names:?}");
    assert!(names.contains(&"generation_metrics"), "tables: {names:?}");
    assert!(names.contains(&"user_profiles"), "tables: {names:?}");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (pool, db_name) = create_test_db().await;

    // create_test_db already ran migrations once; a second run is a no-op.
    pool::run_migrations(&pool)
        .await
        .expect("re-running migrations should succeed");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn status_check_constraint_rejects_unknown_status() {
    let (pool, db_name) = create_test_db().await;

    let result = sqlx::query(
        "INSERT INTO generation_requests (id, user_id, kind, status) \
         VALUES ($1, $2, 'plan', 'paused')",
    )
    .bind(uuid::Uuid::new_v4())
    .bind(uuid::Uuid::new_v4())
    .execute(&pool)
    .await;
    assert!(result.is_err(), "unknown status must violate the CHECK constraint");

    pool.close().await;
    drop_test_db(&db_name).await;
}
