//! Unit tests for operation tracking

use super::*;
use proptest::prelude::*;

#[tokio::test]
async fn test_track_and_succeed() {
    let tracker = OperationTracker::new();
    let (completion, pending) = tracker.track::<u32>();

    assert_eq!(tracker.len(), 1);
    assert!(tracker.contains(&completion.id()));
    assert_eq!(completion.id(), pending.id());

    assert!(completion.succeed(7));
    assert!(tracker.is_empty());
    assert_eq!(pending.await.unwrap(), 7);
}

#[tokio::test]
async fn test_resolves_only_once() {
    let tracker = OperationTracker::new();
    let (completion, pending) = tracker.track::<&'static str>();

    assert!(completion.fail(ClientError::Protocol("first".to_string())));
    assert!(!completion.succeed("second"));
    assert!(completion.is_resolved());

    assert_eq!(
        pending.await.unwrap_err(),
        ClientError::Protocol("first".to_string())
    );
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let tracker = OperationTracker::new();
    let (completion, _pending) = tracker.track::<()>();
    let (_other, _other_pending) = tracker.track::<()>();
    assert_eq!(tracker.len(), 2);

    completion.succeed(());
    assert_eq!(tracker.len(), 1);

    completion.cleanup();
    completion.cleanup();
    assert_eq!(tracker.len(), 1);
}

#[tokio::test]
async fn test_fail_all_fails_every_unresolved_operation() {
    let tracker = OperationTracker::new();
    let (done, done_pending) = tracker.track::<u8>();
    let (a, a_pending) = tracker.track::<u8>();
    let (b, b_pending) = tracker.track::<String>();

    done.succeed(1);

    let reason = ClientError::ConnectionLost("reset by peer".to_string());
    assert_eq!(tracker.fail_all(&reason), 2);
    assert!(tracker.is_empty());

    assert!(a.is_resolved());
    assert!(b.is_resolved());
    assert_eq!(done_pending.await.unwrap(), 1);
    assert_eq!(a_pending.await.unwrap_err(), reason);
    assert_eq!(b_pending.await.unwrap_err(), reason);

    // A late result from the worker is ignored
    assert!(!a.succeed(2));
    assert_eq!(tracker.fail_all(&reason), 0);
}

#[tokio::test]
async fn test_fail_all_leaves_later_registrations_alone() {
    let tracker = OperationTracker::new();
    let (_early, early_pending) = tracker.track::<()>();

    let reason = ClientError::ConnectionLost("gone".to_string());
    tracker.fail_all(&reason);

    let (late, late_pending) = tracker.track::<()>();
    assert_eq!(tracker.len(), 1);
    assert!(!late.is_resolved());

    late.succeed(());
    assert!(early_pending.await.is_err());
    assert!(late_pending.await.is_ok());
}

#[tokio::test]
async fn test_dropped_completion_cancels() {
    let tracker = OperationTracker::new();
    let (completion, pending) = tracker.track::<u8>();
    drop(completion);

    assert!(tracker.is_empty());
    assert!(matches!(pending.await, Err(ClientError::Cancelled(_))));
}

#[tokio::test]
async fn test_dropped_caller_still_resolves() {
    let tracker = OperationTracker::new();
    let (completion, pending) = tracker.track::<u8>();
    drop(pending);

    assert!(completion.succeed(3));
    assert!(tracker.is_empty());
}

proptest! {
    #[test]
    fn test_every_operation_resolves_exactly_once(
        actions in prop::collection::vec(0u8..3, 1..40)
    ) {
        tokio_test::block_on(async {
            let tracker = OperationTracker::new();
            let mut live = Vec::new();
            let mut results = Vec::new();

            for action in actions {
                match action {
                    0 => live.push(tracker.track::<usize>()),
                    1 => {
                        if let Some((completion, pending)) = live.pop() {
                            prop_assert!(completion.succeed(1));
                            prop_assert!(!completion.succeed(2));
                            results.push(pending);
                        }
                    }
                    _ => {
                        let outstanding = tracker.len();
                        let reason = ClientError::ConnectionLost("loss".to_string());
                        prop_assert_eq!(tracker.fail_all(&reason), outstanding);
                        prop_assert!(tracker.is_empty());
                        for (completion, pending) in live.drain(..) {
                            prop_assert!(completion.is_resolved());
                            results.push(pending);
                        }
                    }
                }
                prop_assert_eq!(tracker.len(), live.len());
            }

            for pending in results {
                match pending.await {
                    Ok(value) => prop_assert_eq!(value, 1),
                    Err(err) => prop_assert_eq!(err, ClientError::ConnectionLost("loss".to_string())),
                }
            }
            Ok(())
        })?;
    }
}
