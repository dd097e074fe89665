use super::*;
use crate::config::ReconnectPolicy;
use tether_ssh::loopback::LoopbackEngine;

fn options() -> ConnectionOptions {
    ConnectionOptions::new("localhost")
        .with_user("tester")
        .with_password("pw")
}

fn manager(engine: &LoopbackEngine, options: ConnectionOptions) -> LifecycleManager {
    LifecycleManager::new(options, Arc::new(engine.clone())).unwrap()
}

/// Resolve the operation with its epoch once the epoch has a connection
fn spawn_waiter(handle: EpochHandle, completion: Completion<Epoch>) {
    tokio::spawn(async move {
        let result = handle.connection().await.map(|_| handle.epoch());
        completion.complete(result);
    });
}

async fn wait_for_state(manager: &LifecycleManager, state: LinkState) {
    let mut rx = manager.subscribe();
    rx.wait_for(|current| *current == state).await.unwrap();
}

#[test]
fn test_invalid_options_rejected() {
    let engine = LoopbackEngine::new();
    let result = LifecycleManager::new(
        ConnectionOptions::new("localhost").with_buffer_size(0),
        Arc::new(engine),
    );
    assert!(matches!(result, Err(ClientError::Config(_))));
}

#[tokio::test]
async fn test_connect_reaches_ready() {
    let engine = LoopbackEngine::new();
    let manager = manager(&engine, options());
    assert_eq!(manager.state(), LinkState::Idle);

    manager.connect();
    manager.connect();
    let connection = manager.wait_ready().await.unwrap();

    assert!(!connection.is_closed());
    assert_eq!(manager.state(), LinkState::Ready);
    assert_eq!(engine.connect_attempts(), 1);
    assert_eq!(engine.live_connections(), 1);
}

#[tokio::test]
async fn test_operations_queue_until_connected() {
    let engine = LoopbackEngine::new();
    let manager = manager(&engine, options());

    let (handle, completion, pending) = manager.begin::<Epoch>();
    spawn_waiter(handle, completion);
    assert_eq!(manager.pending_operations(), 1);

    manager.connect();
    assert_eq!(pending.await.unwrap(), Epoch(0));
    assert_eq!(manager.pending_operations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_refused_connection_fails_epoch_and_retries() {
    let engine = LoopbackEngine::new();
    engine.set_refuse_connections(true);
    let manager = manager(&engine, options());

    let (handle, completion, pending) = manager.begin::<Epoch>();
    spawn_waiter(handle, completion);
    manager.connect();

    let err = pending.await.unwrap_err();
    assert!(matches!(err, ClientError::Connect(_)), "unexpected error: {:?}", err);
    assert_eq!(manager.epoch(), Epoch(1));

    engine.set_refuse_connections(false);
    manager.wait_ready().await.unwrap();
    assert_eq!(engine.connect_attempts(), 2);
    assert_eq!(manager.state(), LinkState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let engine = LoopbackEngine::new();
    engine.set_connect_delay(Some(Duration::from_secs(60)));
    let manager = manager(&engine, options().with_connect_timeout(Duration::from_secs(2)));

    let (handle, completion, pending) = manager.begin::<Epoch>();
    spawn_waiter(handle, completion);
    manager.connect();

    match pending.await {
        Err(ClientError::Connect(msg)) => assert!(msg.contains("timed out"), "{}", msg),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_fails_operations_and_reconnects() {
    let engine = LoopbackEngine::new();
    let manager = manager(&engine, options());
    manager.connect();
    manager.wait_ready().await.unwrap();
    let first = manager.epoch();

    // Registered but never resolved by a worker: only the sweep can fail it.
    let (_handle, _completion, pending) = manager.begin::<()>();
    engine.drop_connections("server went away");

    assert_eq!(
        pending.await.unwrap_err(),
        ClientError::ConnectionLost("server went away".to_string())
    );
    assert_eq!(manager.state(), LinkState::Lost);

    wait_for_state(&manager, LinkState::Ready).await;
    assert!(manager.epoch() > first);
    assert_eq!(engine.connect_attempts(), 2);
    assert_eq!(engine.live_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_declined_credentials_are_terminal() {
    let engine = LoopbackEngine::new();
    let manager = manager(&engine, ConnectionOptions::new("localhost").with_user("tester"));

    let (handle, completion, pending) = manager.begin::<Epoch>();
    spawn_waiter(handle, completion);
    manager.connect();

    assert!(matches!(pending.await, Err(ClientError::Auth(_))));
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(engine.auth_attempts(), 1);
    assert_eq!(manager.state(), LinkState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_operations_after_terminal_failure_fail_fast() {
    let engine = LoopbackEngine::new();
    let manager = manager(&engine, ConnectionOptions::new("localhost").with_user("tester"));
    manager.connect();
    wait_for_state(&manager, LinkState::Failed).await;
    let stopped_at = manager.epoch();

    let (handle, completion, pending) = manager.begin::<Epoch>();
    assert!(handle.has_ended());
    spawn_waiter(handle, completion);

    let outcome = tokio::time::timeout(Duration::from_secs(60), pending).await;
    assert!(
        matches!(outcome, Ok(Err(ClientError::Auth(_)))),
        "unexpected outcome: {:?}",
        outcome
    );
    assert_eq!(manager.epoch(), stopped_at);
    assert_eq!(manager.pending_operations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_give_up_after_limit() {
    let engine = LoopbackEngine::new();
    engine.set_password(Some("right"));
    let policy = ReconnectPolicy::default().with_max_auth_failures(Some(2));
    let manager = manager(&engine, options().with_reconnect(policy));

    manager.connect();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(engine.auth_attempts(), 2);
    assert_eq!(manager.state(), LinkState::Failed);
    assert!(matches!(manager.wait_ready().await, Err(ClientError::Auth(_))));

    // A fresh connect starts a new supervisor on a new epoch.
    let stopped_at = manager.epoch();
    engine.set_password(None);
    manager.connect();
    assert!(manager.epoch() > stopped_at);

    let (handle, completion, pending) = manager.begin::<Epoch>();
    spawn_waiter(handle, completion);
    assert_eq!(pending.await.unwrap(), manager.epoch());
    assert_eq!(engine.auth_attempts(), 3);
}

#[tokio::test]
async fn test_disconnect_fails_pending_and_goes_idle() {
    let engine = LoopbackEngine::new();
    let manager = manager(&engine, options());
    manager.connect();
    manager.wait_ready().await.unwrap();

    let (_handle, _completion, pending) = manager.begin::<()>();
    manager.disconnect().await;

    assert_eq!(
        pending.await.unwrap_err(),
        ClientError::ConnectionLost("connection closed by user".to_string())
    );
    assert_eq!(manager.state(), LinkState::Idle);
    assert_eq!(engine.live_connections(), 0);

    // Issued while idle: waits for the next connect.
    let (handle, completion, pending) = manager.begin::<Epoch>();
    spawn_waiter(handle, completion);
    manager.connect();
    assert!(pending.await.is_ok());
}

#[tokio::test]
async fn test_drop_cancels_outstanding_operations() {
    let engine = LoopbackEngine::new();
    let manager = manager(&engine, options());

    let (handle, completion, pending) = manager.begin::<Epoch>();
    spawn_waiter(handle, completion);
    drop(manager);

    assert!(matches!(pending.await, Err(ClientError::Cancelled(_))));
}

#[test]
fn test_link_state_display() {
    assert_eq!(LinkState::Authenticating.to_string(), "authenticating");
    assert_eq!(Epoch(3).to_string(), "#3");
    assert_eq!(Epoch(3).get(), 3);
}
