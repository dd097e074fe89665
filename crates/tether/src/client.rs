//! Public client API
//!
//! Every operation returns a [`Pending`] right away and does its work on a
//! spawned task: wait for the connection of the epoch current at the call,
//! then run a command on a dedicated channel or a file operation on the
//! epoch's shared file-transfer handle. A connection loss fails everything
//! still outstanding; the client itself reconnects in the background and
//! later calls go to the new connection.

use crate::config::{ConnectionOptions, ReconnectPolicy};
use crate::deadline::Deadline;
use crate::exec::{self, CommandOutput};
use crate::lifecycle::{Epoch, LifecycleManager, LinkState};
use crate::transfer::{self, TransferSummary};
use crate::tracker::Pending;
use crate::{fileops, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tether_ssh::{Connection, DirEntry, FileAttributes, FileTransfer, ServerStatus, SshEngine};
use tokio::sync::watch;
use tracing::debug;

/// Reconnecting SSH client
///
/// Methods that start work spawn onto the current Tokio runtime and must be
/// called from within one.
pub struct SshClient {
    lifecycle: LifecycleManager,
}

impl SshClient {
    /// Create an idle client; call [`connect`](Self::connect) to start
    pub fn new(options: ConnectionOptions, engine: Arc<dyn SshEngine>) -> Result<Self> {
        Ok(Self {
            lifecycle: LifecycleManager::new(options, engine)?,
        })
    }

    /// Start building a client for `[user@]host[:port]`
    pub fn builder(target: &str) -> ClientBuilder {
        ClientBuilder::new(target)
    }

    /// Options the client was created with
    pub fn options(&self) -> &ConnectionOptions {
        self.lifecycle.options()
    }

    /// Start connecting (and keep reconnecting)
    pub fn connect(&self) {
        self.lifecycle.connect();
    }

    /// Stop reconnecting, close the connection and fail outstanding operations
    pub async fn disconnect(&self) {
        self.lifecycle.disconnect().await;
    }

    /// Current connection state
    pub fn state(&self) -> LinkState {
        self.lifecycle.state()
    }

    /// Receive connection state changes
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.lifecycle.subscribe()
    }

    /// Current connection epoch
    pub fn epoch(&self) -> Epoch {
        self.lifecycle.epoch()
    }

    /// Number of unresolved operations in the current epoch
    pub fn pending_operations(&self) -> usize {
        self.lifecycle.pending_operations()
    }

    /// Wait for the current epoch's connection
    pub async fn wait_ready(&self) -> Result<Arc<dyn Connection>> {
        self.lifecycle.wait_ready().await
    }

    /// Run a command, collecting its exit code and output
    ///
    /// A `timeout` overrides the configured command timeout; when it fires
    /// the command's channel is closed.
    pub fn run(&self, command: impl Into<String>, timeout: Option<Duration>) -> Pending<CommandOutput> {
        let command = command.into();
        let timeout = self.effective_timeout(timeout);
        let (epoch, completion, pending) = self.lifecycle.begin();

        tokio::spawn(async move {
            let result: Result<CommandOutput> = async {
                let connection = epoch.connection().await?;
                exec::run_command(&connection, &command, timeout).await
            }
            .await;
            if let Err(e) = &result {
                debug!("Command {:?} failed: {}", command, e);
            }
            completion.complete(result);
        });
        pending
    }

    /// List a remote directory, optionally keeping only names matching a glob
    pub fn ls(
        &self,
        path: impl Into<String>,
        pattern: Option<&str>,
        timeout: Option<Duration>,
    ) -> Pending<Vec<DirEntry>> {
        let path = path.into();
        let pattern = pattern.map(str::to_string);
        self.file_op("ls", timeout, move |sftp, deadline| async move {
            fileops::list_directory(&sftp, &path, pattern.as_deref(), deadline).await
        })
    }

    /// Download `remote` to the local path `local`
    pub fn get(
        &self,
        remote: impl Into<String>,
        local: impl AsRef<Path>,
        timeout: Option<Duration>,
    ) -> Pending<TransferSummary> {
        let remote = remote.into();
        let local = local.as_ref().to_path_buf();
        let buffer_size = self.options().buffer_size;
        let max_requests = self.options().max_requests;
        self.file_op("get", timeout, move |sftp, deadline| async move {
            transfer::download(&sftp, &remote, &local, buffer_size, max_requests, deadline).await
        })
    }

    /// Upload the local path `local` to `remote`
    pub fn put(
        &self,
        local: impl AsRef<Path>,
        remote: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Pending<TransferSummary> {
        let local: PathBuf = local.as_ref().to_path_buf();
        let remote = remote.into();
        let buffer_size = self.options().buffer_size;
        self.file_op("put", timeout, move |sftp, deadline| async move {
            transfer::upload(&sftp, &local, &remote, buffer_size, deadline).await
        })
    }

    /// Remove a remote file
    pub fn rm(&self, path: impl Into<String>, timeout: Option<Duration>) -> Pending<ServerStatus> {
        let path = path.into();
        self.file_op("rm", timeout, move |sftp, deadline| async move {
            deadline.run(sftp.remove_file(&path)).await
        })
    }

    /// Remove an empty remote directory
    pub fn rmdir(&self, path: impl Into<String>, timeout: Option<Duration>) -> Pending<ServerStatus> {
        let path = path.into();
        self.file_op("rmdir", timeout, move |sftp, deadline| async move {
            deadline.run(sftp.remove_directory(&path)).await
        })
    }

    /// Create a remote directory
    pub fn mkdir(&self, path: impl Into<String>, timeout: Option<Duration>) -> Pending<ServerStatus> {
        let path = path.into();
        self.file_op("mkdir", timeout, move |sftp, deadline| async move {
            deadline.run(sftp.make_directory(&path, FileAttributes::default())).await
        })
    }

    /// Rename a remote file or directory
    pub fn rename(
        &self,
        old_path: impl Into<String>,
        new_path: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Pending<ServerStatus> {
        let old_path = old_path.into();
        let new_path = new_path.into();
        self.file_op("rename", timeout, move |sftp, deadline| async move {
            deadline.run(sftp.rename_file(&old_path, &new_path)).await
        })
    }

    /// Create a symbolic link at `link_path` pointing to `target_path`
    pub fn ln(
        &self,
        link_path: impl Into<String>,
        target_path: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Pending<ServerStatus> {
        let link_path = link_path.into();
        let target_path = target_path.into();
        self.file_op("ln", timeout, move |sftp, deadline| async move {
            deadline.run(sftp.make_link(&link_path, &target_path)).await
        })
    }

    /// Set the permission bits of a remote path
    pub fn chmod(&self, path: impl Into<String>, mode: u32, timeout: Option<Duration>) -> Pending<ServerStatus> {
        let path = path.into();
        self.file_op("chmod", timeout, move |sftp, deadline| async move {
            deadline.run(fileops::set_mode(&sftp, &path, mode)).await
        })
    }

    /// Change the owning user of a remote path, keeping its group
    pub fn chown(&self, path: impl Into<String>, uid: u32, timeout: Option<Duration>) -> Pending<ServerStatus> {
        let path = path.into();
        self.file_op("chown", timeout, move |sftp, deadline| async move {
            deadline.run(fileops::set_owner(&sftp, &path, Some(uid), None)).await
        })
    }

    /// Change the owning group of a remote path, keeping its user
    pub fn chgrp(&self, path: impl Into<String>, gid: u32, timeout: Option<Duration>) -> Pending<ServerStatus> {
        let path = path.into();
        self.file_op("chgrp", timeout, move |sftp, deadline| async move {
            deadline.run(fileops::set_owner(&sftp, &path, None, Some(gid))).await
        })
    }

    /// Attributes of a remote path, following symbolic links
    pub fn stat(&self, path: impl Into<String>, timeout: Option<Duration>) -> Pending<FileAttributes> {
        let path = path.into();
        self.file_op("stat", timeout, move |sftp, deadline| async move {
            deadline.run(sftp.get_attrs(&path, true)).await
        })
    }

    fn effective_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        timeout.or(self.options().command_timeout)
    }

    /// Spawn `work` against the current epoch's file-transfer handle
    ///
    /// The timeout bounds the work itself, not the wait for a connection.
    /// The work enforces it step by step through its [`Deadline`] so that a
    /// timed-out operation still closes any remote handle it opened. The
    /// shared channel stays open for the other operations of the epoch.
    fn file_op<T, F, Fut>(&self, name: &'static str, timeout: Option<Duration>, work: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn FileTransfer>, Deadline) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let timeout = self.effective_timeout(timeout);
        let (epoch, completion, pending) = self.lifecycle.begin();

        tokio::spawn(async move {
            let result: Result<T> = async move {
                let connection = epoch.connection().await?;
                let sftp = epoch.file_transfer(&connection).await?;
                work(sftp, Deadline::after(timeout)).await
            }
            .await;
            if let Err(e) = &result {
                debug!("{} failed: {}", name, e);
            }
            completion.complete(result);
        });
        pending
    }
}

/// Builder for [`SshClient`]
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    options: ConnectionOptions,
}

impl ClientBuilder {
    /// Start from a `[user@]host[:port]` target
    pub fn new(target: &str) -> Self {
        let (user, host, port) = Self::parse_target(target);
        Self {
            options: ConnectionOptions::new(host).with_user(user).with_port(port),
        }
    }

    /// Split a target into user (empty if absent), host and port
    fn parse_target(target: &str) -> (String, String, u16) {
        let (user, rest) = match target.rsplit_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => (String::new(), target),
        };

        // Bracketed IPv6: [::1]:2222
        if let Some(stripped) = rest.strip_prefix('[') {
            if let Some((host, tail)) = stripped.split_once(']') {
                let port = tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(22);
                return (user, host.to_string(), port);
            }
        }

        match rest.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(port) => (user, host.to_string(), port),
                Err(_) => (user, rest.to_string(), 22),
            },
            _ => (user, rest.to_string(), 22),
        }
    }

    /// Set the password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.options = self.options.with_password(password);
        self
    }

    /// Set the transfer chunk size
    pub fn with_buffer_size(mut self, buffer_size: u32) -> Self {
        self.options = self.options.with_buffer_size(buffer_size);
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_connect_timeout(timeout);
        self
    }

    /// Set the default command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_command_timeout(Some(timeout));
        self
    }

    /// Set how many chunk reads a download keeps in flight
    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.options = self.options.with_max_requests(max_requests);
        self
    }

    /// Set the reconnect policy
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.options = self.options.with_reconnect(reconnect);
        self
    }

    /// The options built so far
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Validate the options and create an idle client
    pub fn build(self, engine: Arc<dyn SshEngine>) -> Result<SshClient> {
        SshClient::new(self.options, engine)
    }
}
