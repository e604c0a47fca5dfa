use super::{ExecutionLock, LeaseClock, LockAttempt};
use crate::errors::RollupError;
use crate::rollup::testing::{fixed_ts, memory_store};
use chrono::Duration;

async fn lock() -> ExecutionLock {
    memory_store().await.execution_lock()
}

#[tokio::test]
async fn concurrent_acquire_has_exactly_one_winner() {
    let lock = lock().await;
    let now = fixed_ts(2026, 1, 1, 11, 5, 0);

    let (a, b) = tokio::join!(
        lock.acquire("task-1", "node-a", Duration::seconds(120), now),
        lock.acquire("task-1", "node-b", Duration::seconds(120), now),
    );
    let attempts = [a.expect("acquire a"), b.expect("acquire b")];

    let winners = attempts
        .iter()
        .filter(|attempt| matches!(attempt, LockAttempt::Acquired(_)))
        .count();
    assert_eq!(winners, 1);
    assert!(attempts
        .iter()
        .any(|attempt| matches!(attempt, LockAttempt::Busy { .. })));
}

#[tokio::test]
async fn busy_reports_current_holder_and_expiry() {
    let lock = lock().await;
    let now = fixed_ts(2026, 1, 1, 11, 5, 0);

    lock.acquire("task-1", "node-a", Duration::seconds(120), now)
        .await
        .expect("acquire");
    let second = lock
        .acquire("task-1", "node-b", Duration::seconds(120), now + Duration::seconds(30))
        .await
        .expect("second acquire");

    assert_eq!(
        second,
        LockAttempt::Busy {
            holder: "node-a".to_string(),
            lease_until: now + Duration::seconds(120),
        }
    );
}

#[tokio::test]
async fn acquire_is_not_reentrant_for_the_same_holder() {
    let lock = lock().await;
    let now = fixed_ts(2026, 1, 1, 11, 5, 0);

    lock.acquire("task-1", "node-a", Duration::seconds(120), now)
        .await
        .expect("acquire");
    let again = lock
        .acquire("task-1", "node-a", Duration::seconds(120), now)
        .await
        .expect("re-acquire");
    assert!(matches!(again, LockAttempt::Busy { .. }));
}

#[tokio::test]
async fn expired_lease_can_be_taken_over() {
    let lock = lock().await;
    let now = fixed_ts(2026, 1, 1, 11, 5, 0);

    lock.acquire("task-1", "node-a", Duration::seconds(120), now)
        .await
        .expect("acquire");

    let later = now + Duration::seconds(120);
    let takeover = lock
        .acquire("task-1", "node-b", Duration::seconds(120), later)
        .await
        .expect("takeover");
    match takeover {
        LockAttempt::Acquired(token) => assert_eq!(token.holder, "node-b"),
        other => panic!("expected takeover, got {other:?}"),
    }
    assert_eq!(
        lock.current_holder("task-1", later)
            .await
            .expect("holder")
            .as_deref(),
        Some("node-b")
    );
}

#[tokio::test]
async fn renew_extends_a_live_lease() {
    let lock = lock().await;
    let now = fixed_ts(2026, 1, 1, 11, 5, 0);

    let token = match lock
        .acquire("task-1", "node-a", Duration::seconds(120), now)
        .await
        .expect("acquire")
    {
        LockAttempt::Acquired(token) => token,
        other => panic!("expected acquisition, got {other:?}"),
    };

    let renewed = lock
        .renew(&token, now + Duration::seconds(60))
        .await
        .expect("renew");
    assert_eq!(renewed.lease_until, now + Duration::seconds(180));
    assert_eq!(renewed.lease_id, token.lease_id);

    // Another node still sees the extended lease at the original expiry.
    let attempt = lock
        .acquire("task-1", "node-b", Duration::seconds(120), now + Duration::seconds(150))
        .await
        .expect("acquire b");
    assert!(matches!(attempt, LockAttempt::Busy { .. }));
}

#[tokio::test]
async fn renew_after_takeover_reports_lease_expired() {
    let lock = lock().await;
    let now = fixed_ts(2026, 1, 1, 11, 5, 0);

    let token = match lock
        .acquire("task-1", "node-a", Duration::seconds(60), now)
        .await
        .expect("acquire")
    {
        LockAttempt::Acquired(token) => token,
        other => panic!("expected acquisition, got {other:?}"),
    };

    let later = now + Duration::seconds(90);
    lock.acquire("task-1", "node-b", Duration::seconds(60), later)
        .await
        .expect("takeover");

    let err = lock.renew(&token, later).await.expect_err("stale renew");
    assert!(matches!(err, RollupError::LeaseExpired(id) if id == "task-1"));
}

#[tokio::test]
async fn release_only_drops_the_matching_lease() {
    let lock = lock().await;
    let now = fixed_ts(2026, 1, 1, 11, 5, 0);

    let stale = match lock
        .acquire("task-1", "node-a", Duration::seconds(60), now)
        .await
        .expect("acquire")
    {
        LockAttempt::Acquired(token) => token,
        other => panic!("expected acquisition, got {other:?}"),
    };
    let later = now + Duration::seconds(61);
    lock.acquire("task-1", "node-b", Duration::seconds(60), later)
        .await
        .expect("takeover");

    lock.release(&stale).await.expect("stale release");
    assert_eq!(
        lock.current_holder("task-1", later)
            .await
            .expect("holder")
            .as_deref(),
        Some("node-b")
    );
}

#[tokio::test]
async fn released_lock_is_immediately_acquirable() {
    let lock = lock().await;
    let now = fixed_ts(2026, 1, 1, 11, 5, 0);

    let token = match lock
        .acquire("task-1", "node-a", Duration::seconds(120), now)
        .await
        .expect("acquire")
    {
        LockAttempt::Acquired(token) => token,
        other => panic!("expected acquisition, got {other:?}"),
    };
    lock.release(&token).await.expect("release");

    assert_eq!(lock.current_holder("task-1", now).await.expect("holder"), None);
    let next = lock
        .acquire("task-1", "node-b", Duration::seconds(120), now)
        .await
        .expect("acquire b");
    assert!(matches!(next, LockAttempt::Acquired(_)));
}

#[tokio::test]
async fn non_positive_lease_is_rejected() {
    let lock = lock().await;
    let err = lock
        .acquire("task-1", "node-a", Duration::zero(), fixed_ts(2026, 1, 1, 0, 0, 0))
        .await
        .expect_err("zero lease");
    assert!(matches!(err, RollupError::Validation(_)));
}

#[tokio::test]
async fn sub_second_expiry_is_not_rounded_away() {
    let lock = lock().await;
    let now = fixed_ts(2026, 1, 1, 11, 5, 0) + Duration::milliseconds(900);

    lock.acquire("task-1", "node-a", Duration::milliseconds(1_500), now)
        .await
        .expect("acquire");

    let before_expiry = now + Duration::milliseconds(1_400);
    let attempt = lock
        .acquire("task-1", "node-b", Duration::seconds(2), before_expiry)
        .await
        .expect("acquire b");
    assert_eq!(
        attempt,
        LockAttempt::Busy {
            holder: "node-a".to_string(),
            lease_until: now + Duration::milliseconds(1_500),
        }
    );

    let at_expiry = now + Duration::milliseconds(1_500);
    let takeover = lock
        .acquire("task-1", "node-b", Duration::seconds(2), at_expiry)
        .await
        .expect("takeover");
    assert!(matches!(takeover, LockAttempt::Acquired(_)));
}

#[tokio::test]
async fn lease_clock_keeps_running_from_its_origin() {
    let origin = fixed_ts(2026, 1, 1, 11, 5, 0);
    let clock = LeaseClock::starting_at(origin);
    let first = clock.now();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let second = clock.now();

    assert!(first >= origin);
    assert!(second >= first + Duration::milliseconds(50));
    assert!(second < origin + Duration::seconds(5));
}
