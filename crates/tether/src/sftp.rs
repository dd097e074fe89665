//! Per-epoch file-transfer channel
//!
//! A connection epoch owns at most one file-transfer channel. The first file
//! operation opens it; concurrent and later operations share the same
//! pending (or ready) open. A failed open is forgotten so the next caller
//! retries, and the channel is closed when the epoch ends.

use crate::{ClientError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tether_ssh::{Connection, FileTransfer};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

type SharedOpen = Shared<BoxFuture<'static, Result<Arc<dyn FileTransfer>>>>;

/// Lazily opened file-transfer handle shared by one epoch
pub struct FileTransferSession {
    /// Deadline for opening the channel
    timeout: Duration,
    /// Cached open and bookkeeping
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    /// Bumped on every new open attempt
    generation: u64,
    /// Pending or completed open
    open: Option<(u64, SharedOpen)>,
    /// Set once the owning epoch has ended
    closed: bool,
}

impl FileTransferSession {
    /// Create an empty session
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Get the epoch's file-transfer handle, opening the channel if needed
    pub async fn get(&self, connection: &Arc<dyn Connection>) -> Result<Arc<dyn FileTransfer>> {
        let (generation, open) = {
            let mut state = self.lock();
            if state.closed {
                return Err(ClientError::ConnectionLost(
                    "file-transfer session closed".to_string(),
                ));
            }
            match &state.open {
                Some((generation, open)) => (*generation, open.clone()),
                None => {
                    state.generation += 1;
                    let generation = state.generation;
                    debug!("Opening file-transfer channel (attempt {})", generation);
                    let open = open_channel(Arc::clone(connection), self.timeout)
                        .boxed()
                        .shared();
                    state.open = Some((generation, open.clone()));
                    (generation, open)
                }
            }
        };

        let result = open.await;

        let late = {
            let mut state = self.lock();
            if result.is_err() && matches!(&state.open, Some((g, _)) if *g == generation) {
                state.open = None;
            }
            state.closed
        };

        match result {
            Ok(handle) if late => {
                handle.close().await;
                Err(ClientError::ConnectionLost("file-transfer session closed".to_string()))
            }
            other => other,
        }
    }

    /// Whether a ready handle is cached
    pub fn is_open(&self) -> bool {
        let state = self.lock();
        matches!(&state.open, Some((_, open)) if matches!(open.peek(), Some(Ok(_))))
    }

    /// Close the cached handle and refuse further opens
    pub async fn shutdown(&self) {
        let cached = {
            let mut state = self.lock();
            state.closed = true;
            state.open.take()
        };

        let handle = cached.and_then(|(_, open)| match open.peek() {
            Some(Ok(handle)) => Some(Arc::clone(handle)),
            _ => None,
        });

        if let Some(handle) = handle {
            debug!("Closing file-transfer channel");
            handle.close().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Open a session channel and start the `sftp` subsystem on it
async fn open_channel(
    connection: Arc<dyn Connection>,
    timeout: Duration,
) -> Result<Arc<dyn FileTransfer>> {
    let deadline = Instant::now() + timeout;

    let mut channel = match timeout_at(deadline, connection.open_session()).await {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            warn!("File-transfer channel open failed: {}", e);
            return Err(e.into());
        }
        Err(_) => return Err(ClientError::Timeout { duration: timeout }),
    };

    match timeout_at(deadline, channel.request_subsystem("sftp")).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            channel.close().await;
            return Err(e.into());
        }
        Err(_) => {
            warn!("File-transfer subsystem not ready after {:?}", timeout);
            channel.close().await;
            return Err(ClientError::Timeout { duration: timeout });
        }
    }

    let handle = channel.into_file_transfer()?;
    debug!("Created file-transfer client");
    Ok(handle)
}
