use super::RollupService;
use crate::errors::RollupError;
use crate::rollup::aggregator::AggregatorRegistry;
use crate::rollup::models::{RollupRun, RunStatus, UpdateRollupTaskRequest};
use crate::rollup::storage::RollupStore;
use crate::rollup::testing::{fixed_ts, hourly_request, memory_store};
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::Notify;

async fn service() -> (RollupService, RollupStore) {
    let store = memory_store().await;
    let service = RollupService::new(store.clone(), Arc::new(AggregatorRegistry::with_builtins()), 30);
    (service, store)
}

#[tokio::test]
async fn create_persists_the_batch_and_wakes_the_manager() {
    let (service, store) = service().await;
    let wake = Arc::new(Notify::new());
    let service = service.with_wake(wake.clone());

    let created = service
        .create(
            vec![hourly_request("cpu-hourly"), hourly_request("mem-hourly")],
            fixed_ts(2026, 1, 1, 9, 0, 0),
        )
        .await
        .expect("create");
    assert_eq!(created.len(), 2);
    assert_eq!(store.read().await.expect("read").len(), 2);

    // notify_one stores a permit when nobody is waiting yet.
    tokio::time::timeout(std::time::Duration::from_secs(1), wake.notified())
        .await
        .expect("manager was woken");
}

#[tokio::test]
async fn invalid_request_names_its_index_and_persists_nothing() {
    let (service, store) = service().await;
    let mut bad = hourly_request("bad");
    bad.window_seconds = 0;

    let err = service
        .create(vec![hourly_request("good"), bad], fixed_ts(2026, 1, 1, 9, 0, 0))
        .await
        .expect_err("invalid batch");
    assert!(matches!(&err, RollupError::Validation(message) if message.starts_with("request[1]")));
    assert!(store.read().await.expect("read").is_empty());
}

#[tokio::test]
async fn unknown_aggregator_is_rejected_at_create() {
    let (service, _) = service().await;
    let mut request = hourly_request("cpu-hourly");
    request.aggregator.name = "median".to_string();

    let err = service
        .create(vec![request], fixed_ts(2026, 1, 1, 9, 0, 0))
        .await
        .expect_err("unknown aggregator");
    assert!(matches!(&err, RollupError::Validation(message) if message.contains("median")));
    assert!(
        err.to_string()
            .contains("available: avg, count, max, min, percentile, sum"),
        "unexpected: {err}"
    );
}

#[tokio::test]
async fn duplicate_ids_in_one_batch_are_rejected() {
    let (service, _) = service().await;
    let err = service
        .create(
            vec![hourly_request("cpu-hourly"), hourly_request("cpu-hourly")],
            fixed_ts(2026, 1, 1, 9, 0, 0),
        )
        .await
        .expect_err("duplicate ids");
    assert!(matches!(err, RollupError::Validation(_)));
}

#[tokio::test]
async fn get_and_status_report_missing_tasks() {
    let (service, _) = service().await;
    assert!(matches!(service.get("missing").await, Err(RollupError::NotFound(_))));
    assert!(matches!(service.status("missing").await, Err(RollupError::NotFound(_))));
    assert!(matches!(service.list_runs("missing", 10).await, Err(RollupError::NotFound(_))));
}

#[tokio::test]
async fn status_combines_task_cursor_and_runs() {
    let (service, store) = service().await;
    let now = fixed_ts(2026, 1, 1, 9, 0, 0);
    service
        .create(vec![hourly_request("cpu-hourly")], now)
        .await
        .expect("create");
    store
        .record_run(&RollupRun {
            id: "run-1".to_string(),
            task_id: "cpu-hourly".to_string(),
            window_start: now,
            window_end: now + Duration::hours(1),
            status: RunStatus::Success,
            attempt: 0,
            points_written: 1,
            holder: "node-a".to_string(),
            error_message: None,
            started_at: now + Duration::hours(2),
            finished_at: now + Duration::hours(2),
        })
        .await
        .expect("record run");

    let status = service.status("cpu-hourly").await.expect("status");
    assert_eq!(status.task.id, "cpu-hourly");
    assert_eq!(status.cursor.position, now);
    assert_eq!(status.recent_runs.len(), 1);
}

#[tokio::test]
async fn update_leaves_cursor_alone_when_window_is_unchanged() {
    let (service, store) = service().await;
    let now = fixed_ts(2026, 1, 1, 9, 0, 0);
    service
        .create(vec![hourly_request("cpu-hourly")], now)
        .await
        .expect("create");
    let cursor = store.read_cursor("cpu-hourly").await.expect("cursor");
    let advanced = store
        .write_cursor(&cursor, &cursor.advanced_to(fixed_ts(2026, 1, 1, 11, 0, 0), now))
        .await
        .expect("advance");

    let updated = service
        .update(
            UpdateRollupTaskRequest {
                task_id: "cpu-hourly".to_string(),
                name: Some("cpu rollup".to_string()),
                ..UpdateRollupTaskRequest::default()
            },
            now + Duration::hours(3),
        )
        .await
        .expect("update");
    assert_eq!(updated.name, "cpu rollup");
    assert_eq!(store.read_cursor("cpu-hourly").await.expect("cursor"), advanced);
}

#[tokio::test]
async fn update_with_new_window_realigns_the_cursor() {
    let (service, store) = service().await;
    let now = fixed_ts(2026, 1, 1, 9, 0, 0);
    service
        .create(vec![hourly_request("cpu-hourly")], now)
        .await
        .expect("create");
    let cursor = store.read_cursor("cpu-hourly").await.expect("cursor");
    store
        .write_cursor(&cursor, &cursor.advanced_to(fixed_ts(2026, 1, 1, 11, 0, 0), now))
        .await
        .expect("advance");

    service
        .update(
            UpdateRollupTaskRequest {
                task_id: "cpu-hourly".to_string(),
                window_seconds: Some(4 * 3600),
                ..UpdateRollupTaskRequest::default()
            },
            now + Duration::hours(3),
        )
        .await
        .expect("update");

    let cursor = store.read_cursor("cpu-hourly").await.expect("cursor");
    assert_eq!(cursor.position, fixed_ts(2026, 1, 1, 8, 0, 0));
}

#[tokio::test]
async fn re_enabling_clears_attempts_and_backoff() {
    let (service, store) = service().await;
    let now = fixed_ts(2026, 1, 1, 9, 0, 0);
    service
        .create(vec![hourly_request("cpu-hourly")], now)
        .await
        .expect("create");
    let cursor = store.read_cursor("cpu-hourly").await.expect("cursor");
    store
        .write_cursor(&cursor, &cursor.failed_attempt("source query timed out", None, now))
        .await
        .expect("fail");
    store
        .set_enabled("cpu-hourly", false, Some("source query timed out"), now)
        .await
        .expect("disable");

    let updated = service
        .update(
            UpdateRollupTaskRequest {
                task_id: "cpu-hourly".to_string(),
                enabled: Some(true),
                ..UpdateRollupTaskRequest::default()
            },
            now + Duration::hours(1),
        )
        .await
        .expect("re-enable");
    assert!(updated.enabled);
    assert_eq!(updated.last_error, None);

    let cursor = store.read_cursor("cpu-hourly").await.expect("cursor");
    assert_eq!(cursor.attempt, 0);
    assert_eq!(cursor.next_attempt_at, None);
    assert_eq!(cursor.last_error, None);
    assert_eq!(cursor.position, now);
}

#[tokio::test]
async fn update_of_missing_task_is_not_found() {
    let (service, _) = service().await;
    let err = service
        .update(
            UpdateRollupTaskRequest {
                task_id: "missing".to_string(),
                ..UpdateRollupTaskRequest::default()
            },
            fixed_ts(2026, 1, 1, 9, 0, 0),
        )
        .await
        .expect_err("missing");
    assert!(matches!(err, RollupError::NotFound(_)));
}

#[tokio::test]
async fn deleted_ids_cannot_be_recreated() {
    let (service, _) = service().await;
    let now = fixed_ts(2026, 1, 1, 9, 0, 0);
    service
        .create(vec![hourly_request("cpu-hourly")], now)
        .await
        .expect("create");

    service.delete("cpu-hourly").await.expect("delete");
    assert!(matches!(service.delete("cpu-hourly").await, Err(RollupError::NotFound(_))));

    let err = service
        .create(vec![hourly_request("cpu-hourly")], now)
        .await
        .expect_err("tombstoned");
    assert!(matches!(err, RollupError::Validation(_)));
}

#[tokio::test]
async fn rename_leaves_a_disabled_task_disabled() {
    let (service, store) = service().await;
    let now = fixed_ts(2026, 1, 1, 9, 0, 0);
    service
        .create(vec![hourly_request("cpu-hourly")], now)
        .await
        .expect("create");
    store
        .set_enabled("cpu-hourly", false, Some("destination rejected write"), now)
        .await
        .expect("disable");

    let updated = service
        .update(
            UpdateRollupTaskRequest {
                task_id: "cpu-hourly".to_string(),
                name: Some("cpu rollup".to_string()),
                ..UpdateRollupTaskRequest::default()
            },
            now + Duration::hours(1),
        )
        .await
        .expect("rename");
    assert_eq!(updated.name, "cpu rollup");
    assert!(!updated.enabled);
    assert_eq!(updated.last_error.as_deref(), Some("destination rejected write"));
}

#[tokio::test]
async fn re_enabling_with_a_new_window_clears_the_cursor_error() {
    let (service, store) = service().await;
    let now = fixed_ts(2026, 1, 1, 9, 0, 0);
    service
        .create(vec![hourly_request("cpu-hourly")], now)
        .await
        .expect("create");
    let cursor = store.read_cursor("cpu-hourly").await.expect("cursor");
    store
        .write_cursor(&cursor, &cursor.failed_attempt("source query timed out", None, now))
        .await
        .expect("fail");
    store
        .set_enabled("cpu-hourly", false, Some("source query timed out"), now)
        .await
        .expect("disable");

    let updated = service
        .update(
            UpdateRollupTaskRequest {
                task_id: "cpu-hourly".to_string(),
                enabled: Some(true),
                window_seconds: Some(2 * 3600),
                ..UpdateRollupTaskRequest::default()
            },
            now + Duration::hours(1),
        )
        .await
        .expect("update");
    assert!(updated.enabled);
    assert_eq!(updated.window_seconds, 2 * 3600);

    let cursor = store.read_cursor("cpu-hourly").await.expect("cursor");
    assert_eq!(cursor.position, fixed_ts(2026, 1, 1, 8, 0, 0));
    assert_eq!(cursor.attempt, 0);
    assert_eq!(cursor.last_error, None);
}
