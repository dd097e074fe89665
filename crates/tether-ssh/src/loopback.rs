//! In-process engine serving the local machine
//!
//! `LoopbackEngine` answers `exec` requests from a scripted handler and
//! serves file-transfer requests straight from the local filesystem. It
//! exposes switches to refuse connections, reject credentials, stall replies,
//! cap read sizes and drop live connections, which is what the client's
//! reconnect and timeout paths need to be exercised without a server.

use async_trait::async_trait;
use bytes::Bytes;
use crate::{
    ChannelEvent, ChannelOpenError, Connection, Credentials, DirEntry, FileAttributes,
    FileTransfer, OpenFlags, RemoteDirectory, RemoteFile, ServerStatus, SessionChannel,
    SftpError, SshEngine, StatusCode, Transport, TransportError, EXTENDED_DATA_STDERR,
};
use std::collections::VecDeque;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

/// Reply produced by an exec handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecReply {
    /// The command ran to completion
    Output {
        /// Exit status, `None` if the server never reports one
        exit_status: Option<u32>,
        /// Standard output
        stdout: Bytes,
        /// Standard error
        stderr: Bytes,
    },
    /// The command never answers
    Hang,
}

impl ExecReply {
    /// Successful command with the given stdout
    pub fn ok(stdout: impl Into<Bytes>) -> Self {
        ExecReply::Output {
            exit_status: Some(0),
            stdout: stdout.into(),
            stderr: Bytes::new(),
        }
    }
}

type ExecHandler = Arc<dyn Fn(&str) -> ExecReply + Send + Sync>;

/// Engine answering from the local process
#[derive(Clone)]
pub struct LoopbackEngine {
    state: Arc<EngineState>,
}

struct EngineState {
    password: Mutex<Option<String>>,
    exec_handler: Mutex<ExecHandler>,
    refuse_connections: AtomicBool,
    stall_subsystem: AtomicBool,
    refuse_channels: Mutex<Option<ChannelOpenError>>,
    connect_delay: Mutex<Option<Duration>>,
    max_read_len: Mutex<Option<u32>>,
    dir_batch: AtomicUsize,
    connections: Mutex<Vec<Arc<ConnectionState>>>,
    connect_attempts: AtomicUsize,
    auth_attempts: AtomicUsize,
    sessions_opened: AtomicUsize,
    subsystems_started: AtomicUsize,
    channels_closed: AtomicUsize,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    /// Create an engine accepting any password
    pub fn new() -> Self {
        Self {
            state: Arc::new(EngineState {
                password: Mutex::new(None),
                exec_handler: Mutex::new(Arc::new(default_exec)),
                refuse_connections: AtomicBool::new(false),
                stall_subsystem: AtomicBool::new(false),
                refuse_channels: Mutex::new(None),
                connect_delay: Mutex::new(None),
                max_read_len: Mutex::new(None),
                dir_batch: AtomicUsize::new(64),
                connections: Mutex::new(Vec::new()),
                connect_attempts: AtomicUsize::new(0),
                auth_attempts: AtomicUsize::new(0),
                sessions_opened: AtomicUsize::new(0),
                subsystems_started: AtomicUsize::new(0),
                channels_closed: AtomicUsize::new(0),
            }),
        }
    }

    /// Only accept this password (`None` accepts any non-empty password)
    pub fn set_password(&self, password: Option<&str>) {
        *lock(&self.state.password) = password.map(str::to_string);
    }

    /// Replace the exec handler
    pub fn set_exec_handler<F>(&self, handler: F)
    where
        F: Fn(&str) -> ExecReply + Send + Sync + 'static,
    {
        *lock(&self.state.exec_handler) = Arc::new(handler);
    }

    /// Refuse (or accept again) new transport connections
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Delay every transport connect
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *lock(&self.state.connect_delay) = delay;
    }

    /// Refuse session channels with the given error
    pub fn set_refuse_channels(&self, error: Option<ChannelOpenError>) {
        *lock(&self.state.refuse_channels) = error;
    }

    /// Never acknowledge subsystem requests
    pub fn set_stall_subsystem(&self, stall: bool) {
        self.state.stall_subsystem.store(stall, Ordering::SeqCst);
    }

    /// Cap the number of bytes returned by a single read
    pub fn set_max_read_len(&self, max: Option<u32>) {
        *lock(&self.state.max_read_len) = max;
    }

    /// Number of entries returned per directory read
    pub fn set_dir_batch(&self, batch: usize) {
        self.state.dir_batch.store(batch.max(1), Ordering::SeqCst);
    }

    /// Close every live connection with the given reason
    pub fn drop_connections(&self, reason: &str) {
        let connections: Vec<_> = lock(&self.state.connections).drain(..).collect();
        debug!("Dropping {} loopback connections", connections.len());
        for connection in connections {
            connection.close(reason);
        }
    }

    /// Number of connections currently open
    pub fn live_connections(&self) -> usize {
        let mut connections = lock(&self.state.connections);
        connections.retain(|c| !c.is_closed());
        connections.len()
    }

    /// Number of transport connects attempted
    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of authentication attempts
    pub fn auth_attempts(&self) -> usize {
        self.state.auth_attempts.load(Ordering::SeqCst)
    }

    /// Number of session channels opened
    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    /// Number of file-transfer subsystems started
    pub fn subsystems_started(&self) -> usize {
        self.state.subsystems_started.load(Ordering::SeqCst)
    }

    /// Number of channels closed by the client
    pub fn channels_closed(&self) -> usize {
        self.state.channels_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SshEngine for LoopbackEngine {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        debug!("Loopback connect to {}:{} (timeout {:?})", host, port, timeout);

        let delay = *lock(&self.state.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(format!(
                "Connection refused by {}:{}",
                host, port
            )));
        }

        Ok(Box::new(LoopbackTransport {
            state: Arc::clone(&self.state),
        }))
    }
}

struct LoopbackTransport {
    state: Arc<EngineState>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn secure(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn authenticate(
        self: Box<Self>,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        self.state.auth_attempts.fetch_add(1, Ordering::SeqCst);
        let offered = credentials.password()?;

        let expected = lock(&self.state.password).clone();
        if let Some(expected) = expected {
            if expected != offered {
                return Err(TransportError::Authentication(format!(
                    "Permission denied for {}",
                    credentials.user
                )));
            }
        }

        let connection = Arc::new(ConnectionState::new());
        lock(&self.state.connections).push(Arc::clone(&connection));

        Ok(Arc::new(LoopbackConnection {
            engine: Arc::clone(&self.state),
            state: connection,
        }))
    }
}

struct ConnectionState {
    closed: watch::Sender<Option<String>>,
}

impl ConnectionState {
    fn new() -> Self {
        let (closed, _) = watch::channel(None);
        Self { closed }
    }

    fn close(&self, reason: &str) {
        self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.to_string());
                true
            } else {
                false
            }
        });
    }

    fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    async fn wait_closed(&self) -> String {
        let mut rx = self.closed.subscribe();
        let reason = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection dropped".to_string(),
        };
        reason
    }

    fn check(&self) -> Result<(), SftpError> {
        if self.is_closed() {
            Err(SftpError::new(StatusCode::ConnectionLost, "Connection lost"))
        } else {
            Ok(())
        }
    }
}

struct LoopbackConnection {
    engine: Arc<EngineState>,
    state: Arc<ConnectionState>,
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn open_session(&self) -> Result<Box<dyn SessionChannel>, ChannelOpenError> {
        if self.state.is_closed() {
            return Err(ChannelOpenError::Other("connection closed".to_string()));
        }
        if let Some(error) = lock(&self.engine.refuse_channels).clone() {
            return Err(error);
        }
        self.engine.sessions_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(LoopbackChannel {
            engine: Arc::clone(&self.engine),
            connection: Arc::clone(&self.state),
            events: VecDeque::new(),
            closed: false,
        }))
    }

    async fn closed(&self) -> TransportError {
        TransportError::Closed(self.state.wait_closed().await)
    }

    async fn disconnect(&self) {
        self.state.close("connection closed by client");
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

struct LoopbackChannel {
    engine: Arc<EngineState>,
    connection: Arc<ConnectionState>,
    events: VecDeque<ChannelEvent>,
    closed: bool,
}

#[async_trait]
impl SessionChannel for LoopbackChannel {
    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        if self.connection.is_closed() {
            return Err(TransportError::Closed("connection closed".to_string()));
        }
        let handler = lock(&self.engine.exec_handler).clone();

        match (*handler)(command) {
            ExecReply::Output {
                exit_status,
                stdout,
                stderr,
            } => {
                if !stdout.is_empty() {
                    self.events.push_back(ChannelEvent::Data(stdout));
                }
                if !stderr.is_empty() {
                    self.events.push_back(ChannelEvent::ExtendedData {
                        data_type: EXTENDED_DATA_STDERR,
                        data: stderr,
                    });
                }
                if let Some(status) = exit_status {
                    self.events.push_back(ChannelEvent::ExitStatus(status));
                }
                self.events.push_back(ChannelEvent::Eof);
                self.events.push_back(ChannelEvent::Closed);
            }
            ExecReply::Hang => {}
        }
        Ok(())
    }

    async fn send_eof(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        self.connection.wait_closed().await;
        self.closed = true;
        Some(ChannelEvent::Closed)
    }

    async fn request_subsystem(&mut self, name: &str) -> Result<(), TransportError> {
        if name != "sftp" {
            return Err(TransportError::Protocol(format!("Unknown subsystem: {}", name)));
        }
        if self.engine.stall_subsystem.load(Ordering::SeqCst) {
            let reason = self.connection.wait_closed().await;
            return Err(TransportError::Closed(reason));
        }
        self.engine.subsystems_started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn into_file_transfer(self: Box<Self>) -> Result<Arc<dyn FileTransfer>, TransportError> {
        Ok(Arc::new(LoopbackSftp {
            engine: Arc::clone(&self.engine),
            connection: Arc::clone(&self.connection),
        }))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.engine.channels_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct LoopbackSftp {
    engine: Arc<EngineState>,
    connection: Arc<ConnectionState>,
}

#[async_trait]
impl FileTransfer for LoopbackSftp {
    async fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Box<dyn RemoteFile>, SftpError> {
        self.connection.check()?;

        let file = tokio::fs::OpenOptions::new()
            .read(flags.read)
            .write(flags.write || flags.append)
            .append(flags.append)
            .create(flags.create && !flags.exclusive)
            .create_new(flags.create && flags.exclusive)
            .truncate(flags.truncate)
            .open(path)
            .await?;

        if let (true, Some(mode)) = (flags.create, attrs.permissions) {
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
                .await?;
        }

        Ok(Box::new(LoopbackFile {
            engine: Arc::clone(&self.engine),
            connection: Arc::clone(&self.connection),
            file: tokio::sync::Mutex::new(file),
        }))
    }

    async fn open_directory(&self, path: &str) -> Result<Box<dyn RemoteDirectory>, SftpError> {
        self.connection.check()?;

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.path().symlink_metadata()?;
            let filename = entry.file_name().to_string_lossy().into_owned();
            let attrs = attributes_from(&metadata);
            entries.push(DirEntry {
                longname: long_name(&filename, &attrs),
                filename,
                attrs,
            });
        }

        let batch = self.engine.dir_batch.load(Ordering::SeqCst);
        Ok(Box::new(LoopbackDirectory {
            connection: Arc::clone(&self.connection),
            entries: entries.into(),
            batch,
        }))
    }

    async fn get_attrs(&self, path: &str, follow_links: bool) -> Result<FileAttributes, SftpError> {
        self.connection.check()?;
        let metadata = if follow_links {
            tokio::fs::metadata(path).await?
        } else {
            tokio::fs::symlink_metadata(path).await?
        };
        Ok(attributes_from(&metadata))
    }

    async fn set_attrs(&self, path: &str, attrs: FileAttributes) -> Result<ServerStatus, SftpError> {
        self.connection.check()?;
        if let Some(mode) = attrs.permissions {
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
                .await?;
        }
        if attrs.uid.is_some() || attrs.gid.is_some() {
            std::os::unix::fs::chown(path, attrs.uid, attrs.gid)?;
        }
        Ok(ServerStatus::new("setstat succeeded"))
    }

    async fn make_directory(&self, path: &str, attrs: FileAttributes) -> Result<ServerStatus, SftpError> {
        self.connection.check()?;
        tokio::fs::create_dir(path).await?;
        if let Some(mode) = attrs.permissions {
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
                .await?;
        }
        Ok(ServerStatus::new("mkdir succeeded"))
    }

    async fn remove_directory(&self, path: &str) -> Result<ServerStatus, SftpError> {
        self.connection.check()?;
        tokio::fs::remove_dir(path).await?;
        Ok(ServerStatus::new("rmdir succeeded"))
    }

    async fn remove_file(&self, path: &str) -> Result<ServerStatus, SftpError> {
        self.connection.check()?;
        tokio::fs::remove_file(path).await?;
        Ok(ServerStatus::new("remove succeeded"))
    }

    async fn rename_file(&self, old_path: &str, new_path: &str) -> Result<ServerStatus, SftpError> {
        self.connection.check()?;
        tokio::fs::rename(old_path, new_path).await?;
        Ok(ServerStatus::new("rename succeeded"))
    }

    async fn make_link(&self, link_path: &str, target_path: &str) -> Result<ServerStatus, SftpError> {
        self.connection.check()?;
        tokio::fs::symlink(target_path, link_path).await?;
        Ok(ServerStatus::new("symlink succeeded"))
    }

    async fn close(&self) {
        self.engine.channels_closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct LoopbackFile {
    engine: Arc<EngineState>,
    connection: Arc<ConnectionState>,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

#[async_trait]
impl RemoteFile for LoopbackFile {
    async fn read_chunk(&self, offset: u64, length: u32) -> Result<Bytes, SftpError> {
        self.connection.check()?;
        let cap = *lock(&self.engine.max_read_len);
        let wanted = cap.map_or(length, |cap| cap.min(length)) as usize;

        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; wanted];
        let mut filled = 0;
        while filled < wanted {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 && wanted > 0 {
            return Err(SftpError::eof());
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn write_chunk(&self, offset: u64, data: Bytes) -> Result<(), SftpError> {
        self.connection.check()?;
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        Ok(())
    }

    async fn get_attrs(&self) -> Result<FileAttributes, SftpError> {
        self.connection.check()?;
        let file = self.file.lock().await;
        let metadata = file.metadata().await?;
        Ok(attributes_from(&metadata))
    }

    async fn close(&self) -> Result<(), SftpError> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        Ok(())
    }
}

struct LoopbackDirectory {
    connection: Arc<ConnectionState>,
    entries: VecDeque<DirEntry>,
    batch: usize,
}

#[async_trait]
impl RemoteDirectory for LoopbackDirectory {
    async fn read(&mut self) -> Result<Vec<DirEntry>, SftpError> {
        self.connection.check()?;
        if self.entries.is_empty() {
            return Err(SftpError::eof());
        }
        let take = self.batch.min(self.entries.len());
        Ok(self.entries.drain(..take).collect())
    }

    async fn close(&mut self) -> Result<(), SftpError> {
        self.entries.clear();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn default_exec(command: &str) -> ExecReply {
    let command = command.trim();
    if let Some(rest) = command.strip_prefix("echo ") {
        return ExecReply::ok(format!("{}\n", rest));
    }
    match command {
        "true" => ExecReply::ok(Bytes::new()),
        "false" => ExecReply::Output {
            exit_status: Some(1),
            stdout: Bytes::new(),
            stderr: Bytes::new(),
        },
        _ => ExecReply::Output {
            exit_status: Some(127),
            stdout: Bytes::new(),
            stderr: Bytes::from(format!("sh: {}: command not found\n", command)),
        },
    }
}

fn attributes_from(metadata: &std::fs::Metadata) -> FileAttributes {
    FileAttributes {
        size: Some(metadata.len()),
        uid: Some(metadata.uid()),
        gid: Some(metadata.gid()),
        permissions: Some(metadata.mode()),
        atime: u32::try_from(metadata.atime()).ok(),
        mtime: u32::try_from(metadata.mtime()).ok(),
    }
}

fn long_name(filename: &str, attrs: &FileAttributes) -> String {
    let mode = attrs.permissions.unwrap_or(0);
    let kind = if attrs.is_dir() {
        'd'
    } else if attrs.is_symlink() {
        'l'
    } else {
        '-'
    };
    let mut perms = String::with_capacity(10);
    perms.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    format!(
        "{} 1 {:<8} {:<8} {:>8} {}",
        perms,
        attrs.uid.unwrap_or(0),
        attrs.gid.unwrap_or(0),
        attrs.size.unwrap_or(0),
        filename
    )
}

/// Paths handed to the loopback engine are plain local paths
pub fn local_path(path: impl Into<PathBuf>) -> String {
    path.into().to_string_lossy().into_owned()
}
