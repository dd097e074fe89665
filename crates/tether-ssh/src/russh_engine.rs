//! Engine speaking SSH over TCP through `russh`
//!
//! The TCP connect, key exchange and user authentication map one to one onto
//! [`SshEngine::connect`], [`Transport::secure`] and
//! [`Transport::authenticate`]. File transfer runs on a raw `russh-sftp`
//! session so that reads and writes address remote handles by offset, which
//! is what chunked transfers need.

use async_trait::async_trait;
use bytes::Bytes;
use crate::{
    ChannelEvent, ChannelOpenError, Connection, Credentials, DirEntry, FileAttributes,
    FileTransfer, OpenFlags, RemoteDirectory, RemoteFile, ServerStatus, SessionChannel,
    SftpError, SshEngine, StatusCode, Transport, TransportError,
};
use russh::client::{self, AuthResult, KeyboardInteractiveAuthResponse};
use russh::keys::ssh_key::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect, MethodKind};
use russh_sftp::client::error::Error as RawSftpError;
use russh_sftp::client::rawsession::RawSftpSession;
use russh_sftp::protocol;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

/// Keyboard-interactive rounds answered before giving up
const MAX_PROMPT_ROUNDS: usize = 8;

/// Decides whether a server host key is trusted
pub type HostKeyCheck = Arc<dyn Fn(&PublicKey) -> bool + Send + Sync>;

/// Engine connecting to real SSH servers
#[derive(Clone)]
pub struct RusshEngine {
    config: Arc<client::Config>,
    host_key_check: HostKeyCheck,
    sftp_timeout: Duration,
}

impl Default for RusshEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RusshEngine {
    /// Create an engine with keepalives enabled that accepts any host key
    pub fn new() -> Self {
        let config = client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            host_key_check: Arc::new(|_| {
                warn!("Accepting server host key without verification");
                true
            }),
            sftp_timeout: Duration::from_secs(30),
        }
    }

    /// Replace the protocol configuration
    pub fn with_config(mut self, config: client::Config) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Only trust host keys accepted by `check`
    pub fn with_host_key_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&PublicKey) -> bool + Send + Sync + 'static,
    {
        self.host_key_check = Arc::new(check);
        self
    }

    /// How long a single file-transfer request may go unanswered
    pub fn with_sftp_timeout(mut self, timeout: Duration) -> Self {
        self.sftp_timeout = timeout;
        self
    }
}

#[async_trait]
impl SshEngine for RusshEngine {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let target = format!("{}:{}", host, port);
        debug!("Establishing TCP connection to {}", target);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Connection(format!("{}: {}", target, e)));
            }
            Err(_) => return Err(TransportError::Timeout),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {}: {}", target, e);
        }

        Ok(Box::new(RusshTransport {
            engine: self.clone(),
            target,
            timeout,
            state: TransportState::Connected(stream),
        }))
    }
}

enum TransportState {
    Connected(TcpStream),
    Secured {
        handle: client::Handle<ClientHandler>,
        loss: LossSignal,
    },
    Failed,
}

struct RusshTransport {
    engine: RusshEngine,
    target: String,
    timeout: Duration,
    state: TransportState,
}

#[async_trait]
impl Transport for RusshTransport {
    async fn secure(&mut self) -> Result<(), TransportError> {
        let stream = match std::mem::replace(&mut self.state, TransportState::Failed) {
            TransportState::Connected(stream) => stream,
            secured @ TransportState::Secured { .. } => {
                self.state = secured;
                return Ok(());
            }
            TransportState::Failed => {
                return Err(TransportError::Protocol("transport already failed".to_string()));
            }
        };

        let loss = LossSignal::new();
        let handler = ClientHandler {
            target: self.target.clone(),
            host_key_check: Arc::clone(&self.engine.host_key_check),
            loss: loss.clone(),
        };
        let config = Arc::clone(&self.engine.config);

        let handle = match tokio::time::timeout(self.timeout, client::connect_stream(config, stream, handler)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(transport_error(e)),
            Err(_) => return Err(TransportError::Timeout),
        };
        debug!("Key exchange with {} complete", self.target);

        self.state = TransportState::Secured { handle, loss };
        Ok(())
    }

    async fn authenticate(
        mut self: Box<Self>,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        if matches!(self.state, TransportState::Connected(_)) {
            self.secure().await?;
        }
        let (mut handle, loss) = match std::mem::replace(&mut self.state, TransportState::Failed) {
            TransportState::Secured { handle, loss } => (handle, loss),
            _ => return Err(TransportError::Protocol("transport is not secured".to_string())),
        };

        let user = credentials.user.as_str();
        let auth = handle.authenticate_none(user).await.map_err(transport_error)?;
        if !auth.success() {
            let methods = remaining_methods(&auth);
            debug!("Server offers {:?} for {}", methods, user);
            login(&mut handle, credentials, &methods).await?;
        }

        info!("Authenticated as {} on {}", user, self.target);
        Ok(Arc::new(RusshConnection {
            handle,
            loss,
            sftp_timeout: self.engine.sftp_timeout,
        }))
    }
}

fn remaining_methods(auth: &AuthResult) -> Vec<MethodKind> {
    match auth {
        AuthResult::Failure { remaining_methods, .. } => remaining_methods.iter().copied().collect(),
        AuthResult::Success => Vec::new(),
    }
}

/// Try password, then keyboard-interactive, with the configured password
async fn login(
    handle: &mut client::Handle<ClientHandler>,
    credentials: &Credentials,
    methods: &[MethodKind],
) -> Result<(), TransportError> {
    let password = credentials.password()?;
    let user = credentials.user.as_str();

    if methods.contains(&MethodKind::Password) {
        let auth = handle
            .authenticate_password(user, password)
            .await
            .map_err(transport_error)?;
        if auth.success() {
            return Ok(());
        }
    }

    if methods.contains(&MethodKind::KeyboardInteractive) {
        let mut response = handle
            .authenticate_keyboard_interactive_start(user, None)
            .await
            .map_err(transport_error)?;
        for _ in 0..MAX_PROMPT_ROUNDS {
            response = match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(()),
                KeyboardInteractiveAuthResponse::Failure { .. } => break,
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    let prompts: Vec<(String, bool)> =
                        prompts.into_iter().map(|p| (p.prompt, p.echo)).collect();
                    handle
                        .authenticate_keyboard_interactive_respond(credentials.answer_prompts(&prompts))
                        .await
                        .map_err(transport_error)?
                }
            };
        }
    }

    Err(TransportError::Authentication(format!("Permission denied for {}", user)))
}

/// Records why a connection ended, first reason wins
#[derive(Clone)]
struct LossSignal(Arc<watch::Sender<Option<String>>>);

impl LossSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self(Arc::new(tx))
    }

    fn mark(&self, reason: &str) {
        self.0.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.to_string());
                true
            } else {
                false
            }
        });
    }

    fn is_marked(&self) -> bool {
        self.0.borrow().is_some()
    }

    async fn wait(&self) -> String {
        let mut rx = self.0.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection dropped".to_string(),
        };
        reason
    }
}

/// Session callbacks; dropped by `russh` once the session task ends
struct ClientHandler {
    target: String,
    host_key_check: HostKeyCheck,
    loss: LossSignal,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let trusted = (self.host_key_check)(server_public_key);
        if !trusted {
            warn!("Host key of {} rejected", self.target);
        }
        Ok(trusted)
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        self.loss.mark(&format!("connection to {} closed", self.target));
    }
}

struct RusshConnection {
    handle: client::Handle<ClientHandler>,
    loss: LossSignal,
    sftp_timeout: Duration,
}

#[async_trait]
impl Connection for RusshConnection {
    async fn open_session(&self) -> Result<Box<dyn SessionChannel>, ChannelOpenError> {
        if self.is_closed() {
            return Err(ChannelOpenError::Other("connection closed".to_string()));
        }
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ChannelOpenError::Other(e.to_string()))?;

        Ok(Box::new(RusshChannel {
            channel,
            pending: VecDeque::new(),
            sftp_timeout: self.sftp_timeout,
        }))
    }

    async fn closed(&self) -> TransportError {
        TransportError::Closed(self.loss.wait().await)
    }

    async fn disconnect(&self) {
        self.loss.mark("connection closed by client");
        if let Err(e) = self.handle.disconnect(Disconnect::ByApplication, "", "en").await {
            debug!("Disconnect did not reach the server: {}", e);
        }
    }

    fn is_closed(&self) -> bool {
        self.loss.is_marked() || self.handle.is_closed()
    }
}

struct RusshChannel {
    channel: Channel<client::Msg>,
    /// Messages that arrived while waiting for a request reply
    pending: VecDeque<ChannelMsg>,
    sftp_timeout: Duration,
}

impl RusshChannel {
    async fn wait_reply(&mut self, request: &str) -> Result<(), TransportError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => {
                    return Err(TransportError::Protocol(format!("{} request refused", request)));
                }
                Some(msg) => self.pending.push_back(msg),
                None => {
                    return Err(TransportError::Closed(format!(
                        "channel closed before {} reply",
                        request
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl SessionChannel for RusshChannel {
    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        self.channel.exec(true, command).await.map_err(transport_error)?;
        self.wait_reply("exec").await
    }

    async fn send_eof(&mut self) -> Result<(), TransportError> {
        self.channel.eof().await.map_err(transport_error)
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            let msg = match self.pending.pop_front() {
                Some(msg) => msg,
                None => self.channel.wait().await?,
            };
            if let Some(event) = channel_event(msg) {
                return Some(event);
            }
        }
    }

    async fn request_subsystem(&mut self, name: &str) -> Result<(), TransportError> {
        self.channel
            .request_subsystem(true, name)
            .await
            .map_err(transport_error)?;
        self.wait_reply("subsystem").await
    }

    fn into_file_transfer(self: Box<Self>) -> Result<Arc<dyn FileTransfer>, TransportError> {
        let RusshChannel {
            channel,
            sftp_timeout,
            ..
        } = *self;
        let session = RawSftpSession::new(channel.into_stream());
        Ok(Arc::new(RusshSftp {
            session: Mutex::new(Some(Arc::new(session))),
            ready: OnceCell::new(),
            timeout: sftp_timeout,
        }))
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.close().await {
            debug!("Channel close failed: {}", e);
        }
    }
}

/// Translate a channel message, `None` for messages with no client meaning
fn channel_event(msg: ChannelMsg) -> Option<ChannelEvent> {
    match msg {
        ChannelMsg::Data { data } => Some(ChannelEvent::Data(Bytes::copy_from_slice(&data))),
        ChannelMsg::ExtendedData { data, ext } => Some(ChannelEvent::ExtendedData {
            data_type: ext,
            data: Bytes::copy_from_slice(&data),
        }),
        ChannelMsg::ExitStatus { exit_status } => Some(ChannelEvent::ExitStatus(exit_status)),
        ChannelMsg::Eof => Some(ChannelEvent::Eof),
        ChannelMsg::Close => Some(ChannelEvent::Closed),
        _ => None,
    }
}

fn transport_error(err: russh::Error) -> TransportError {
    match err {
        russh::Error::IO(e) => TransportError::Io(e),
        russh::Error::ConnectionTimeout | russh::Error::KeepaliveTimeout | russh::Error::InactivityTimeout => {
            TransportError::Timeout
        }
        russh::Error::Disconnect | russh::Error::HUP => TransportError::Closed(err.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}

/// File-transfer client on a raw `sftp` session
struct RusshSftp {
    /// Taken on close; the channel goes away with the last reference
    session: Mutex<Option<Arc<RawSftpSession>>>,
    ready: OnceCell<()>,
    timeout: Duration,
}

impl RusshSftp {
    /// The initialized session, or an error once closed
    async fn session(&self) -> Result<Arc<RawSftpSession>, SftpError> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| SftpError::new(StatusCode::NoConnection, "File-transfer session closed"))?;

        self.ready
            .get_or_try_init(|| async {
                session.init().await.map_err(sftp_error)?;
                session.set_timeout(self.timeout.as_secs().max(1)).await;
                debug!("File-transfer session ready");
                Ok::<_, SftpError>(())
            })
            .await?;
        Ok(session)
    }
}

#[async_trait]
impl FileTransfer for RusshSftp {
    async fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Box<dyn RemoteFile>, SftpError> {
        let session = self.session().await?;
        let handle = session
            .open(path, open_flags(flags), wire_attributes(&attrs))
            .await
            .map_err(sftp_error)?;
        Ok(Box::new(RusshFile {
            session,
            handle: handle.handle,
        }))
    }

    async fn open_directory(&self, path: &str) -> Result<Box<dyn RemoteDirectory>, SftpError> {
        let session = self.session().await?;
        let handle = session.opendir(path).await.map_err(sftp_error)?;
        Ok(Box::new(RusshDirectory {
            session,
            handle: handle.handle,
        }))
    }

    async fn get_attrs(&self, path: &str, follow_links: bool) -> Result<FileAttributes, SftpError> {
        let session = self.session().await?;
        let attrs = if follow_links {
            session.stat(path).await
        } else {
            session.lstat(path).await
        };
        Ok(attributes(&attrs.map_err(sftp_error)?.attrs))
    }

    async fn set_attrs(&self, path: &str, attrs: FileAttributes) -> Result<ServerStatus, SftpError> {
        let session = self.session().await?;
        server_status(session.setstat(path, wire_attributes(&attrs)).await)
    }

    async fn make_directory(&self, path: &str, attrs: FileAttributes) -> Result<ServerStatus, SftpError> {
        let session = self.session().await?;
        server_status(session.mkdir(path, wire_attributes(&attrs)).await)
    }

    async fn remove_directory(&self, path: &str) -> Result<ServerStatus, SftpError> {
        let session = self.session().await?;
        server_status(session.rmdir(path).await)
    }

    async fn remove_file(&self, path: &str) -> Result<ServerStatus, SftpError> {
        let session = self.session().await?;
        server_status(session.remove(path).await)
    }

    async fn rename_file(&self, old_path: &str, new_path: &str) -> Result<ServerStatus, SftpError> {
        let session = self.session().await?;
        server_status(session.rename(old_path, new_path).await)
    }

    async fn make_link(&self, link_path: &str, target_path: &str) -> Result<ServerStatus, SftpError> {
        let session = self.session().await?;
        server_status(session.symlink(link_path, target_path).await)
    }

    async fn close(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if session.is_some() {
            debug!("File-transfer session released");
        }
    }
}

struct RusshFile {
    session: Arc<RawSftpSession>,
    handle: String,
}

#[async_trait]
impl RemoteFile for RusshFile {
    async fn read_chunk(&self, offset: u64, length: u32) -> Result<Bytes, SftpError> {
        let data = self
            .session
            .read(self.handle.as_str(), offset, length)
            .await
            .map_err(sftp_error)?;
        Ok(Bytes::from(data.data))
    }

    async fn write_chunk(&self, offset: u64, data: Bytes) -> Result<(), SftpError> {
        self.session
            .write(self.handle.as_str(), offset, data.to_vec())
            .await
            .map_err(sftp_error)?;
        Ok(())
    }

    async fn get_attrs(&self) -> Result<FileAttributes, SftpError> {
        let attrs = self.session.fstat(self.handle.as_str()).await.map_err(sftp_error)?;
        Ok(attributes(&attrs.attrs))
    }

    async fn close(&self) -> Result<(), SftpError> {
        self.session
            .close(self.handle.as_str())
            .await
            .map_err(sftp_error)?;
        Ok(())
    }
}

struct RusshDirectory {
    session: Arc<RawSftpSession>,
    handle: String,
}

#[async_trait]
impl RemoteDirectory for RusshDirectory {
    async fn read(&mut self) -> Result<Vec<DirEntry>, SftpError> {
        let name = self
            .session
            .readdir(self.handle.as_str())
            .await
            .map_err(sftp_error)?;
        Ok(name
            .files
            .into_iter()
            .map(|file| DirEntry {
                attrs: attributes(&file.attrs),
                filename: file.filename,
                longname: file.longname,
            })
            .collect())
    }

    async fn close(&mut self) -> Result<(), SftpError> {
        self.session
            .close(self.handle.as_str())
            .await
            .map_err(sftp_error)?;
        Ok(())
    }
}

fn server_status(result: Result<protocol::Status, RawSftpError>) -> Result<ServerStatus, SftpError> {
    let status = result.map_err(sftp_error)?;
    Ok(ServerStatus {
        message: status.error_message,
        language: status.language_tag,
    })
}

fn sftp_error(err: RawSftpError) -> SftpError {
    match err {
        RawSftpError::Status(status) => SftpError::new(status_code(status.status_code), status.error_message),
        RawSftpError::IO(message) => SftpError::new(StatusCode::ConnectionLost, message),
        RawSftpError::Timeout => SftpError::new(StatusCode::Failure, "File-transfer request timed out"),
        other => SftpError::new(StatusCode::Failure, other.to_string()),
    }
}

fn status_code(code: protocol::StatusCode) -> StatusCode {
    match code {
        protocol::StatusCode::Eof => StatusCode::Eof,
        protocol::StatusCode::NoSuchFile => StatusCode::NoSuchFile,
        protocol::StatusCode::PermissionDenied => StatusCode::PermissionDenied,
        protocol::StatusCode::BadMessage => StatusCode::BadMessage,
        protocol::StatusCode::NoConnection => StatusCode::NoConnection,
        protocol::StatusCode::ConnectionLost => StatusCode::ConnectionLost,
        protocol::StatusCode::OpUnsupported => StatusCode::OpUnsupported,
        _ => StatusCode::Failure,
    }
}

fn open_flags(flags: OpenFlags) -> protocol::OpenFlags {
    let mut wire = protocol::OpenFlags::empty();
    for (set, flag) in [
        (flags.read, protocol::OpenFlags::READ),
        (flags.write, protocol::OpenFlags::WRITE),
        (flags.append, protocol::OpenFlags::APPEND),
        (flags.create, protocol::OpenFlags::CREATE),
        (flags.truncate, protocol::OpenFlags::TRUNCATE),
        (flags.exclusive, protocol::OpenFlags::EXCLUDE),
    ] {
        if set {
            wire |= flag;
        }
    }
    wire
}

fn attributes(attrs: &protocol::FileAttributes) -> FileAttributes {
    FileAttributes {
        size: attrs.size,
        uid: attrs.uid,
        gid: attrs.gid,
        permissions: attrs.permissions,
        atime: attrs.atime,
        mtime: attrs.mtime,
    }
}

fn wire_attributes(attrs: &FileAttributes) -> protocol::FileAttributes {
    protocol::FileAttributes {
        size: attrs.size,
        uid: attrs.uid,
        gid: attrs.gid,
        permissions: attrs.permissions,
        atime: attrs.atime,
        mtime: attrs.mtime,
        ..protocol::FileAttributes::empty()
    }
}
