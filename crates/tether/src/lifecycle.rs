//! Connection lifecycle
//!
//! The [`LifecycleManager`] owns at most one live connection at a time and a
//! supervisor task that keeps trying to have one. Time is cut into epochs:
//! an epoch starts when a connect attempt begins and ends when that attempt
//! fails or the connection it produced is lost. Operations are registered
//! against the epoch current at their creation, wait for that epoch's
//! connection, and are failed in one sweep when the epoch ends. Ending an
//! epoch immediately installs a fresh one, so later operations queue for
//! the next connection instead of inheriting the failure.

use crate::backoff::Backoff;
use crate::config::ConnectionOptions;
use crate::sftp::FileTransferSession;
use crate::tracker::{Completion, OperationTracker, Pending};
use crate::{ClientError, Result};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tether_ssh::{Connection, FileTransfer, SshEngine, TransportError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reason recorded when the caller tears the connection down
const CLOSED_BY_USER: &str = "connection closed by user";

/// Connection state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Not connecting and not connected
    Idle,
    /// Reaching the remote host
    Connecting,
    /// Transport is up, presenting credentials
    Authenticating,
    /// Authenticated connection available
    Ready,
    /// An established connection dropped; a reconnect is scheduled
    Lost,
    /// The last attempt failed; a retry is scheduled unless the failure was terminal
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Connecting => "connecting",
            LinkState::Authenticating => "authenticating",
            LinkState::Ready => "ready",
            LinkState::Lost => "lost",
            LinkState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Sequence number of a connection epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u64);

impl Epoch {
    /// Raw sequence number
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Readiness signal of one epoch
enum Readiness {
    Waiting,
    Ready(Arc<dyn Connection>),
    Ended(ClientError),
}

/// Everything that lives and dies with one epoch
struct EpochSlot {
    epoch: Epoch,
    ready: watch::Sender<Readiness>,
    tracker: OperationTracker,
    file_transfer: FileTransferSession,
}

impl EpochSlot {
    fn new(epoch: Epoch, connect_timeout: Duration) -> Self {
        let (ready, _) = watch::channel(Readiness::Waiting);
        Self {
            epoch,
            ready,
            tracker: OperationTracker::new(),
            file_transfer: FileTransferSession::new(connect_timeout),
        }
    }

    /// Publish the epoch's connection; `false` if the epoch already ended
    fn mark_ready(&self, connection: Arc<dyn Connection>) -> bool {
        self.ready.send_if_modified(|readiness| {
            if matches!(readiness, Readiness::Waiting) {
                *readiness = Readiness::Ready(connection);
                true
            } else {
                false
            }
        })
    }

    /// Signal the end of the epoch and fail whatever is registered
    fn end(&self, reason: &ClientError) -> usize {
        self.ready.send_replace(Readiness::Ended(reason.clone()));
        self.tracker.fail_all(reason)
    }

    fn has_ended(&self) -> bool {
        matches!(&*self.ready.borrow(), Readiness::Ended(_))
    }

    fn is_waiting(&self) -> bool {
        matches!(&*self.ready.borrow(), Readiness::Waiting)
    }
}

/// An operation's view of the epoch it was registered in
#[derive(Clone)]
pub struct EpochHandle {
    slot: Arc<EpochSlot>,
}

impl EpochHandle {
    /// Epoch number
    pub fn epoch(&self) -> Epoch {
        self.slot.epoch
    }

    /// Wait until the epoch has a connection, or fail with the reason it ended
    pub async fn connection(&self) -> Result<Arc<dyn Connection>> {
        let mut rx = self.slot.ready.subscribe();
        let readiness = rx
            .wait_for(|readiness| !matches!(readiness, Readiness::Waiting))
            .await
            .map_err(|_| ClientError::Cancelled("connection epoch dropped".to_string()))?;

        match &*readiness {
            Readiness::Ready(connection) => Ok(Arc::clone(connection)),
            Readiness::Ended(reason) => Err(reason.clone()),
            Readiness::Waiting => Err(ClientError::Cancelled(
                "connection epoch still waiting".to_string(),
            )),
        }
    }

    /// The epoch's shared file-transfer handle, opened on first use
    pub async fn file_transfer(&self, connection: &Arc<dyn Connection>) -> Result<Arc<dyn FileTransfer>> {
        self.slot.file_transfer.get(connection).await
    }

    /// Whether the epoch has ended
    pub fn has_ended(&self) -> bool {
        self.slot.has_ended()
    }
}

/// Supervisor bookkeeping
struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Core {
    current: Arc<EpochSlot>,
    next_epoch: u64,
    supervisor: Option<Supervisor>,
}

struct Inner {
    options: ConnectionOptions,
    engine: Arc<dyn SshEngine>,
    state: watch::Sender<LinkState>,
    core: Mutex<Core>,
}

/// Owns the connection and reconnects it according to the policy
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    /// Create a manager in the idle state
    ///
    /// The options are validated here; nothing touches the network until
    /// [`connect`](Self::connect) is called.
    pub fn new(options: ConnectionOptions, engine: Arc<dyn SshEngine>) -> Result<Self> {
        options.validate()?;
        let (state, _) = watch::channel(LinkState::Idle);
        let current = Arc::new(EpochSlot::new(Epoch(0), options.connect_timeout));

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                engine,
                state,
                core: Mutex::new(Core {
                    current,
                    next_epoch: 1,
                    supervisor: None,
                }),
            }),
        })
    }

    /// Options the manager was created with
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Start connecting; a no-op while a supervisor is already running
    ///
    /// After a terminal failure this opens a fresh epoch for new operations.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let mut core = self.inner.lock();
        if let Some(supervisor) = &core.supervisor {
            if !supervisor.task.is_finished() {
                debug!("Connect requested while already running");
                return;
            }
        }
        if core.current.has_ended() {
            let next = self.inner.successor(&mut core);
            core.current = next;
        }

        info!(
            "Connecting to {}:{}",
            self.inner.options.hostname, self.inner.options.port
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(Arc::clone(&self.inner), cancel.clone()));
        core.supervisor = Some(Supervisor { cancel, task });
    }

    /// Tear down the connection and fail everything outstanding
    ///
    /// Returns once the supervisor has stopped; the state is then
    /// [`LinkState::Idle`]. Operations issued afterwards queue until the
    /// next [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        let reason = ClientError::ConnectionLost(CLOSED_BY_USER.to_string());
        // Operations see the user's reason before the connection goes away.
        self.inner.rotate(reason.clone()).await;

        let supervisor = self.inner.lock().supervisor.take();
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
            if let Err(e) = supervisor.task.await {
                warn!("Connection supervisor ended abnormally: {}", e);
            }
        }

        // The supervisor may have published a connection on the successor
        // before it stopped.
        if !self.inner.current().is_waiting() {
            self.inner.rotate(reason).await;
        }
        self.inner.set_state(LinkState::Idle);
        info!("Disconnected");
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    /// Receive every state change
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    /// Current epoch
    pub fn epoch(&self) -> Epoch {
        self.inner.lock().current.epoch
    }

    /// Number of unresolved operations in the current epoch
    pub fn pending_operations(&self) -> usize {
        self.inner.lock().current.tracker.len()
    }

    /// Wait for the current epoch's connection
    pub async fn wait_ready(&self) -> Result<Arc<dyn Connection>> {
        self.current().connection().await
    }

    /// Handle on the current epoch
    pub fn current(&self) -> EpochHandle {
        EpochHandle {
            slot: Arc::clone(&self.inner.lock().current),
        }
    }

    /// Register a new operation against the current epoch
    ///
    /// Registration happens under the same lock that ends epochs, so an
    /// operation either lands in the epoch being torn down (and is failed
    /// with it) or in its successor.
    pub fn begin<T: Send + 'static>(&self) -> (EpochHandle, Completion<T>, Pending<T>) {
        let core = self.inner.lock();
        let (completion, pending) = core.current.tracker.track();
        let handle = EpochHandle {
            slot: Arc::clone(&core.current),
        };
        (handle, completion, pending)
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        let mut core = self.inner.lock();
        core.current
            .end(&ClientError::Cancelled("client dropped".to_string()));
        if let Some(supervisor) = core.supervisor.take() {
            supervisor.cancel.cancel();
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Link state {} -> {}", previous, state);
        }
    }

    fn current(&self) -> Arc<EpochSlot> {
        Arc::clone(&self.lock().current)
    }

    /// A fresh slot numbered after every epoch handed out so far
    fn successor(&self, core: &mut Core) -> Arc<EpochSlot> {
        let next = Arc::new(EpochSlot::new(
            Epoch(core.next_epoch),
            self.options.connect_timeout,
        ));
        core.next_epoch += 1;
        next
    }

    /// End the current epoch with `reason` and install its successor
    async fn rotate(&self, reason: ClientError) {
        let ended = {
            let mut core = self.lock();
            let next = self.successor(&mut core);
            std::mem::replace(&mut core.current, next)
        };
        self.retire(&ended, &reason).await;
    }

    /// End the current epoch with `reason` and leave it in place
    ///
    /// Operations registered afterwards fail with the same reason until
    /// [`LifecycleManager::connect`] opens a new epoch.
    async fn finish(&self, reason: ClientError) {
        let ended = self.current();
        self.retire(&ended, &reason).await;
    }

    async fn retire(&self, ended: &EpochSlot, reason: &ClientError) {
        let failed = ended.end(reason);
        if failed > 0 {
            info!("Epoch {} ended, failed {} operations: {}", ended.epoch, failed, reason);
        } else {
            debug!("Epoch {} ended: {}", ended.epoch, reason);
        }
        ended.file_transfer.shutdown().await;
    }

    /// One connect attempt: transport, key exchange, authentication
    async fn establish(&self) -> std::result::Result<Arc<dyn Connection>, AttemptError> {
        let options = &self.options;
        let credentials = options.credentials().map_err(AttemptError::Fatal)?;

        let connect = self
            .engine
            .connect(&options.hostname, options.port, options.connect_timeout);
        let mut transport = match tokio::time::timeout(options.connect_timeout, connect).await {
            Ok(result) => result.map_err(AttemptError::classify)?,
            Err(_) => {
                return Err(AttemptError::Retry(ClientError::Connect(format!(
                    "Connection to {}:{} timed out after {:?}",
                    options.hostname, options.port, options.connect_timeout
                ))))
            }
        };

        transport.secure().await.map_err(AttemptError::classify)?;
        self.set_state(LinkState::Authenticating);
        debug!("Authenticating as {}", credentials.user);

        transport
            .authenticate(&credentials)
            .await
            .map_err(AttemptError::classify)
    }
}

/// Why a connect attempt failed, and whether it is worth repeating
#[derive(Debug)]
enum AttemptError {
    /// Network trouble; always retried
    Retry(ClientError),
    /// Credentials rejected by the server; retried a bounded number of times
    Rejected(ClientError),
    /// Retrying cannot help
    Fatal(ClientError),
}

impl AttemptError {
    fn classify(err: TransportError) -> Self {
        match err {
            TransportError::Declined(_) => AttemptError::Fatal(err.into()),
            TransportError::Authentication(_) => AttemptError::Rejected(err.into()),
            TransportError::Closed(msg) => AttemptError::Retry(ClientError::Connect(msg)),
            other => AttemptError::Retry(other.into()),
        }
    }

    fn error(&self) -> &ClientError {
        match self {
            AttemptError::Retry(e) | AttemptError::Rejected(e) | AttemptError::Fatal(e) => e,
        }
    }

    fn into_error(self) -> ClientError {
        match self {
            AttemptError::Retry(e) | AttemptError::Rejected(e) | AttemptError::Fatal(e) => e,
        }
    }
}

/// Connect, serve, and reconnect until cancelled or a terminal failure
async fn supervise(inner: Arc<Inner>, cancel: CancellationToken) {
    let policy = &inner.options.reconnect;
    let mut backoff = Backoff::new(policy.clone());
    let mut auth_failures: u32 = 0;

    loop {
        inner.set_state(LinkState::Connecting);
        let slot = inner.current();

        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            attempt = inner.establish() => attempt,
        };

        match attempt {
            Ok(connection) => {
                backoff.reset();
                auth_failures = 0;
                if !slot.mark_ready(Arc::clone(&connection)) {
                    connection.disconnect().await;
                    return;
                }
                inner.set_state(LinkState::Ready);
                info!(
                    "Connected to {}:{} (epoch {})",
                    inner.options.hostname, inner.options.port, slot.epoch
                );

                let lost = tokio::select! {
                    _ = cancel.cancelled() => {
                        connection.disconnect().await;
                        return;
                    }
                    lost = connection.closed() => lost,
                };

                let reason = match lost {
                    TransportError::Closed(msg) => msg,
                    other => other.to_string(),
                };
                warn!("Connection lost: {}", reason);
                inner.set_state(LinkState::Lost);
                inner.rotate(ClientError::ConnectionLost(reason)).await;
            }
            Err(failure) => {
                warn!("Connection attempt failed: {}", failure.error());
                inner.set_state(LinkState::Failed);

                let terminal = match &failure {
                    AttemptError::Retry(_) => false,
                    AttemptError::Fatal(_) => true,
                    AttemptError::Rejected(_) => {
                        auth_failures += 1;
                        policy.max_auth_failures.is_some_and(|max| auth_failures >= max)
                    }
                };

                if terminal {
                    warn!("Giving up on {}:{}", inner.options.hostname, inner.options.port);
                    inner.finish(failure.into_error()).await;
                    return;
                }
                inner.rotate(failure.into_error()).await;
            }
        }

        let delay = backoff.next_delay();
        info!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests;
