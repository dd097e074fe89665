//! Shared helpers for integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tether::ssh::loopback::{self, LoopbackEngine};
use tether::{ConnectionOptions, ReconnectPolicy, SshClient};

/// Install a test subscriber once; `RUST_LOG` controls the output
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Options for the loopback engine with fast reconnects
pub fn options() -> ConnectionOptions {
    ConnectionOptions::new("localhost")
        .with_user("tester")
        .with_password("secret")
        .with_reconnect(
            ReconnectPolicy::default()
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(50)),
        )
}

/// A connected client over a fresh loopback engine
pub fn connected_client(options: ConnectionOptions) -> (SshClient, LoopbackEngine) {
    init_tracing();
    let engine = LoopbackEngine::new();
    let client = SshClient::new(options, Arc::new(engine.clone())).expect("valid options");
    client.connect();
    (client, engine)
}

/// Remote path string for a local path
pub fn remote(path: &Path) -> String {
    loopback::local_path(path)
}

/// Deterministic test content
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}
