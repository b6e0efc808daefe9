//! Integration tests for the generation-request ledger queries.

use uuid::Uuid;

use planforge_db::models::{GenerationKind, RequestStatus};
use planforge_db::queries::requests;
use planforge_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn insert_and_get_roundtrip() {
    let (pool, db_name) = create_test_db().await;

    let id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    let inserted = requests::insert_request(&pool, id, user_id, GenerationKind::Plan, Some(3))
        .await
        .expect("insert should succeed");

    assert_eq!(inserted.id, id);
    assert_eq!(inserted.user_id, user_id);
    assert_eq!(inserted.status, RequestStatus::Pending);
    assert_eq!(inserted.progress_percent, 0);
    assert_eq!(inserted.target_day, Some(3));

    let fetched = requests::get_request(&pool, id)
        .await
        .expect("get should succeed")
        .expect("row should exist");
    assert_eq!(fetched.id, id);
    assert_eq!(fetched.kind, GenerationKind::Plan);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_missing_request_is_none() {
    let (pool, db_name) = create_test_db().await;

    let fetched = requests::get_request(&pool, Uuid::new_v4())
        .await
        .expect("get should succeed");
    assert!(fetched.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn duplicate_insert_is_unique_violation() {
    let (pool, db_name) = create_test_db().await;

    let id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    requests::insert_request(&pool, id, user_id, GenerationKind::Plan, None)
        .await
        .expect("first insert should succeed");

    let err = requests::insert_request(&pool, id, user_id, GenerationKind::Plan, None)
        .await
        .expect_err("second insert should fail");
    assert!(
        requests::is_unique_violation(&err),
        "expected unique violation, got: {err:#}"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn active_for_user_returns_most_recent_non_terminal() {
    let (pool, db_name) = create_test_db().await;

    let user_id = Uuid::new_v4();

    // No rows yet.
    let active = requests::get_active_for_user(&pool, user_id)
        .await
        .expect("query should succeed");
    assert!(active.is_none());

    // A completed request does not count as active.
    let done_id = Uuid::new_v4();
    requests::insert_request(&pool, done_id, user_id, GenerationKind::Plan, Some(1))
        .await
        .unwrap();
    requests::mark_completed(&pool, done_id, "plan-1").await.unwrap();

    let active = requests::get_active_for_user(&pool, user_id)
        .await
        .expect("query should succeed");
    assert!(active.is_none(), "terminal rows are not active");

    // A pending request does.
    let pending_id = Uuid::new_v4();
    requests::insert_request(&pool, pending_id, user_id, GenerationKind::Plan, Some(2))
        .await
        .unwrap();

    let active = requests::get_active_for_user(&pool, user_id)
        .await
        .expect("query should succeed")
        .expect("pending row should be active");
    assert_eq!(active.id, pending_id);

    // Another user's rows are invisible.
    let active_other = requests::get_active_for_user(&pool, Uuid::new_v4())
        .await
        .expect("query should succeed");
    assert!(active_other.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn progress_is_monotone_and_phase_tracks_latest() {
    let (pool, db_name) = create_test_db().await;

    let id = Uuid::new_v4();
    requests::insert_request(&pool, id, Uuid::new_v4(), GenerationKind::Plan, None)
        .await
        .unwrap();
    requests::mark_started(&pool, id).await.unwrap();

    requests::update_progress(&pool, id, 45, "analyzing").await.unwrap();
    // A late, lower percent must not regress the stored value, but the
    // phase label still follows the last reporter.
    requests::update_progress(&pool, id, 30, "planning").await.unwrap();

    let row = requests::get_request(&pool, id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::InProgress);
    assert_eq!(row.progress_percent, 45);
    assert_eq!(row.current_phase.as_deref(), Some("planning"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn terminal_state_is_sticky() {
    let (pool, db_name) = create_test_db().await;

    let id = Uuid::new_v4();
    requests::insert_request(&pool, id, Uuid::new_v4(), GenerationKind::Plan, None)
        .await
        .unwrap();
    requests::mark_started(&pool, id).await.unwrap();

    let transitioned = requests::mark_completed(&pool, id, "plan-123").await.unwrap();
    assert!(transitioned, "first terminal write should win");

    // A competing failure write is ignored.
    let transitioned = requests::mark_failed(&pool, id, "generation timed out").await.unwrap();
    assert!(!transitioned, "terminal state must be sticky");

    // A competing completion write is ignored too.
    let transitioned = requests::mark_completed(&pool, id, "plan-456").await.unwrap();
    assert!(!transitioned);

    let row = requests::get_request(&pool, id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    assert_eq!(row.result_ref.as_deref(), Some("plan-123"));
    assert_eq!(row.progress_percent, 100);
    assert!(row.error_message.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn late_progress_update_does_not_resurrect() {
    let (pool, db_name) = create_test_db().await;

    let id = Uuid::new_v4();
    requests::insert_request(&pool, id, Uuid::new_v4(), GenerationKind::Split, None)
        .await
        .unwrap();
    requests::mark_failed(&pool, id, "plan validation failed").await.unwrap();

    // A straggling progress write from a disconnected worker is a no-op.
    requests::update_progress(&pool, id, 85, "optimizing").await.unwrap();

    let row = requests::get_request(&pool, id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Failed);
    assert_eq!(row.current_phase.as_deref(), Some("error"));
    assert_eq!(row.error_message.as_deref(), Some("plan validation failed"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn mark_started_tolerates_duplicate_callers() {
    let (pool, db_name) = create_test_db().await;

    let id = Uuid::new_v4();
    requests::insert_request(&pool, id, Uuid::new_v4(), GenerationKind::Plan, Some(5))
        .await
        .unwrap();

    requests::mark_started(&pool, id).await.unwrap();
    // Second start (e.g. a reconnecting stream) is harmless.
    requests::mark_started(&pool, id).await.unwrap();

    let row = requests::get_request(&pool, id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::InProgress);

    pool.close().await;
    drop_test_db(&db_name).await;
}
