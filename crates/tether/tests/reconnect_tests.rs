//! Connection loss, reconnection and teardown

mod common;

use anyhow::Result;
use common::{connected_client, options};
use std::sync::Arc;
use std::time::Duration;
use tether::ssh::loopback::{ExecReply, LoopbackEngine};
use tether::{ClientError, LinkState, ReconnectPolicy, SshClient};
use tokio::time::timeout;

/// Wait until the epoch has moved past `before` and its connection is up
async fn wait_for_new_connection(client: &SshClient, before: tether::Epoch) -> Result<()> {
    timeout(Duration::from_secs(5), async {
        while client.epoch() <= before {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    timeout(Duration::from_secs(5), client.wait_ready()).await??;
    Ok(())
}

async fn wait_for_state(client: &SshClient, state: LinkState) -> Result<()> {
    let mut rx = client.subscribe();
    timeout(Duration::from_secs(5), rx.wait_for(|current| *current == state)).await??;
    Ok(())
}

#[tokio::test]
async fn test_loss_fails_in_flight_and_reconnects() -> Result<()> {
    let (client, engine) = connected_client(options());
    client.wait_ready().await?;
    let first_epoch = client.epoch();

    engine.set_exec_handler(|_| ExecReply::Hang);
    let stuck: Vec<_> = (0..3).map(|_| client.run("sleep 100", None)).collect();
    let listing = client.ls("/", None, None);
    tokio::time::sleep(Duration::from_millis(20)).await;

    engine.drop_connections("server restarted");
    for operation in stuck {
        assert_eq!(
            operation.await.unwrap_err(),
            ClientError::ConnectionLost("server restarted".to_string())
        );
    }
    // The listing may have finished before the loss; it must not hang either way.
    let _ = timeout(Duration::from_secs(5), listing).await?;

    engine.set_exec_handler(|_| ExecReply::ok("back\n"));
    let output = timeout(Duration::from_secs(5), client.run("echo back", None)).await??;
    assert_eq!(output.stdout_lossy(), "back\n");
    assert!(client.epoch() > first_epoch);
    assert_eq!(engine.live_connections(), 1);
    Ok(())
}

#[tokio::test]
async fn test_every_operation_resolves_once_across_losses() -> Result<()> {
    let (client, engine) = connected_client(options());
    engine.set_exec_handler(|command| {
        if command.starts_with("hang") {
            ExecReply::Hang
        } else {
            ExecReply::ok("ok\n")
        }
    });

    let mut pending = Vec::new();
    for round in 0..3 {
        client.wait_ready().await?;
        for i in 0..4 {
            let command = if i % 2 == 0 { "hang" } else { "quick" };
            pending.push(client.run(format!("{} {}", command, round), None));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let before = client.epoch();
        engine.drop_connections("flap");
        wait_for_new_connection(&client, before).await?;
    }

    let mut succeeded = 0;
    let mut lost = 0;
    for operation in pending {
        match timeout(Duration::from_secs(5), operation).await? {
            Ok(output) => {
                assert_eq!(output.stdout_lossy(), "ok\n");
                succeeded += 1;
            }
            Err(ClientError::ConnectionLost(reason)) => {
                assert_eq!(reason, "flap");
                lost += 1;
            }
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert_eq!(succeeded + lost, 12);
    assert!(lost >= 6);
    assert_eq!(client.pending_operations(), 0);
    Ok(())
}

#[tokio::test]
async fn test_operations_during_outage_wait_for_next_connection() -> Result<()> {
    let (client, engine) = connected_client(options());
    client.wait_ready().await?;

    engine.set_refuse_connections(true);
    engine.drop_connections("outage");
    wait_for_state(&client, LinkState::Failed).await?;

    // Issued after the failed attempt: lands in the epoch that is still connecting.
    let pending = client.run("echo later", None);
    tokio::time::sleep(Duration::from_millis(5)).await;
    engine.set_refuse_connections(false);

    let result = timeout(Duration::from_secs(5), pending).await?;
    match result {
        Ok(output) => assert_eq!(output.stdout_lossy(), "later\n"),
        // The retry may still have been refused in the meantime.
        Err(ClientError::Connect(_)) => {
            let output = timeout(Duration::from_secs(5), client.run("echo later", None)).await??;
            assert_eq!(output.stdout_lossy(), "later\n");
        }
        Err(other) => panic!("unexpected error: {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_disconnect_fails_outstanding_and_allows_reconnect() -> Result<()> {
    let (client, engine) = connected_client(options());
    client.wait_ready().await?;
    engine.set_exec_handler(|_| ExecReply::Hang);

    let stuck = client.run("sleep 100", None);
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.disconnect().await;

    assert_eq!(
        stuck.await.unwrap_err(),
        ClientError::ConnectionLost("connection closed by user".to_string())
    );
    assert_eq!(client.state(), LinkState::Idle);
    assert_eq!(engine.live_connections(), 0);

    // Nothing reconnects on its own.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.connect_attempts(), 1);

    engine.set_exec_handler(|_| ExecReply::ok("again\n"));
    client.connect();
    let output = timeout(Duration::from_secs(5), client.run("echo again", None)).await??;
    assert_eq!(output.stdout_lossy(), "again\n");
    assert_eq!(engine.connect_attempts(), 2);
    Ok(())
}

#[tokio::test]
async fn test_missing_password_is_not_retried() -> Result<()> {
    common::init_tracing();
    let engine = LoopbackEngine::new();
    let options = options();
    let options = tether::ConnectionOptions {
        password: None,
        ..options
    };
    let client = SshClient::new(options, Arc::new(engine.clone()))?;

    let pending = client.run("echo hi", None);
    client.connect();
    assert!(matches!(pending.await, Err(ClientError::Auth(_))));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.auth_attempts(), 1);
    assert_eq!(client.state(), LinkState::Failed);
    Ok(())
}

#[tokio::test]
async fn test_wrong_password_retries_then_gives_up() -> Result<()> {
    common::init_tracing();
    let engine = LoopbackEngine::new();
    engine.set_password(Some("the-real-one"));
    let policy = ReconnectPolicy::default()
        .with_initial_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(20))
        .with_max_auth_failures(Some(3));
    let client = SshClient::new(options().with_reconnect(policy), Arc::new(engine.clone()))?;

    client.connect();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(engine.auth_attempts(), 3);
    assert_eq!(client.state(), LinkState::Failed);

    // Nothing is going to connect; new work fails instead of waiting.
    let err = timeout(Duration::from_secs(1), client.run("echo hi", None))
        .await?
        .unwrap_err();
    assert!(matches!(err, ClientError::Auth(_)), "unexpected error: {:?}", err);

    engine.set_password(None);
    client.connect();
    let output = timeout(Duration::from_secs(5), client.run("echo hi", None)).await??;
    assert_eq!(output.stdout_lossy(), "hi\n");
    Ok(())
}
