mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use query_coordinator::error::CoordinationError;
use query_coordinator::models::QueryState;
use query_coordinator::storage::{InMemoryLockableStore, LockableStore};

#[tokio::test]
async fn test_claims_beyond_limit_fail_until_release() {
    let max_next_calls = 3;
    let coordinator = common::coordinator(1, max_next_calls);
    let query_id = coordinator.create_id();
    coordinator
        .create_query(common::checkpoint(query_id), "alice")
        .await
        .unwrap();

    for _ in 0..max_next_calls {
        coordinator.claim_next_call(&query_id).await.unwrap();
    }
    let err = coordinator.claim_next_call(&query_id).await.unwrap_err();
    assert!(matches!(err, CoordinationError::ConcurrencyLimitExceeded { limit: 3, .. }));
    assert!(err.is_retryable());
    assert!(!err.is_fatal());

    coordinator.release_next_call(&query_id).await.unwrap();
    coordinator.claim_next_call(&query_id).await.unwrap();
    assert!(coordinator.claim_next_call(&query_id).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_claims_never_exceed_limit() {
    let coordinator = common::coordinator(1, 3);
    let query_id = coordinator.create_id();
    coordinator
        .create_query(common::checkpoint(query_id), "alice")
        .await
        .unwrap();

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.claim_next_call(&query_id).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(e) => assert!(
                matches!(e, CoordinationError::ConcurrencyLimitExceeded { .. }),
                "unexpected error: {e}"
            ),
        }
    }
    assert_eq!(admitted, 3);

    let status = coordinator.query_status(&query_id).await.unwrap().unwrap();
    assert_eq!(status.active_next_calls, 3);
}

#[tokio::test]
async fn test_release_without_claim_is_rejected() {
    let coordinator = common::coordinator(1, 1);
    let query_id = coordinator.create_id();
    coordinator
        .create_query(common::checkpoint(query_id), "alice")
        .await
        .unwrap();

    let err = coordinator.release_next_call(&query_id).await.unwrap_err();
    assert!(matches!(err, CoordinationError::Internal { .. }));
    let status = coordinator.query_status(&query_id).await.unwrap().unwrap();
    assert_eq!(status.active_next_calls, 0);
    assert_eq!(status.query_state, QueryState::Create);
}

#[tokio::test]
async fn test_removed_query_reports_not_found() {
    let coordinator = common::coordinator(1, 1);
    let query_id = coordinator.create_id();
    coordinator
        .create_query(common::checkpoint(query_id), "alice")
        .await
        .unwrap();
    assert!(coordinator.remove_query(&query_id).await.unwrap());

    let err = coordinator.claim_next_call(&query_id).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_lock_lease_expires_for_crashed_holder() {
    let store = InMemoryLockableStore::new();
    let holder_a = store
        .try_lock("queryStatus:q", Duration::ZERO, Duration::from_millis(100))
        .await
        .unwrap()
        .expect("first holder acquires");

    let holder_b = store
        .try_lock("queryStatus:q", Duration::from_millis(200), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(holder_b.is_some(), "lease should expire within the wait");

    assert!(!store.unlock(&holder_a).await.unwrap());
    assert!(store.unlock(&holder_b.unwrap()).await.unwrap());
}

#[tokio::test]
async fn test_lock_wait_shorter_than_lease_times_out() {
    let store = InMemoryLockableStore::new();
    let _held = store
        .try_lock("taskStates:q", Duration::ZERO, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();

    let started = Instant::now();
    let contender = store
        .try_lock("taskStates:q", Duration::from_millis(50), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(contender.is_none());
    assert!(started.elapsed() >= Duration::from_millis(50));

    let other_query = store
        .try_lock("taskStates:other", Duration::ZERO, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(other_query.is_some());
}
