//! Remote command execution
//!
//! Each command runs on its own session channel: the `exec` request is sent,
//! our side of the channel is closed for input once the server acknowledges
//! it, and output is collected until the server's end-of-file. The exit
//! status may arrive on either side of that end-of-file; when it has not
//! arrived by then, the channel gets a short grace period to deliver it.
//! A channel that closes before its end-of-file did not finish the command
//! and fails with the connection's loss reason.

use crate::{ClientError, Result};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tether_ssh::{ChannelEvent, Connection, SessionChannel, TransportError, EXTENDED_DATA_STDERR};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Exit code reported when the server never sends one
pub const UNKNOWN_EXIT_CODE: u32 = 1;

/// How long a channel may take to deliver its exit status after
/// end-of-file, or to explain why it went away
pub const EXIT_STATUS_GRACE: Duration = Duration::from_secs(2);

/// Result of a remote command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit status, [`UNKNOWN_EXIT_CODE`] if none was reported
    pub exit_code: u32,
    /// Everything written to standard output
    pub stdout: Bytes,
    /// Everything written to standard error
    pub stderr: Bytes,
}

impl CommandOutput {
    /// Whether the command exited with status zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard output decoded lossily as UTF-8
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded lossily as UTF-8
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// How a channel's output stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// The server sent end-of-file
    Eof,
    /// The channel closed, or vanished, first
    Closed,
}

/// Accumulates channel events into a [`CommandOutput`]
#[derive(Debug, Default)]
struct OutputCollector {
    exit_code: Option<u32>,
    stdout: BytesMut,
    stderr: BytesMut,
}

impl OutputCollector {
    /// Record one event, reporting the end of the stream
    fn record(&mut self, event: ChannelEvent) -> Option<StreamEnd> {
        match event {
            ChannelEvent::Data(data) => self.stdout.extend_from_slice(&data),
            ChannelEvent::ExtendedData { data_type, data } if data_type == EXTENDED_DATA_STDERR => {
                self.stderr.extend_from_slice(&data)
            }
            ChannelEvent::ExtendedData { data_type, .. } => {
                debug!("Ignoring extended data of type {}", data_type)
            }
            ChannelEvent::ExitStatus(status) => self.exit_code = Some(status),
            ChannelEvent::Eof => return Some(StreamEnd::Eof),
            ChannelEvent::Closed => return Some(StreamEnd::Closed),
        }
        None
    }

    fn finish(self) -> CommandOutput {
        CommandOutput {
            exit_code: self.exit_code.unwrap_or(UNKNOWN_EXIT_CODE),
            stdout: self.stdout.freeze(),
            stderr: self.stderr.freeze(),
        }
    }
}

/// Run `command` on a fresh session channel of `connection`
///
/// With a timeout, the deadline covers opening the channel and everything
/// up to the server's end-of-file; if it passes first the channel is closed
/// and the command fails with [`ClientError::Timeout`].
pub async fn run_command(
    connection: &Arc<dyn Connection>,
    command: &str,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let deadline = timeout.map(|timeout| (Instant::now() + timeout, timeout));

    let open = connection.open_session();
    let mut channel = match deadline {
        Some((at, duration)) => timeout_at(at, open)
            .await
            .map_err(|_| ClientError::Timeout { duration })??,
        None => open.await?,
    };
    debug!("Opened session channel for {:?}", command);

    let mut collector = OutputCollector::default();
    let started = start_and_wait_eof(channel.as_mut(), command, &mut collector);
    let ended = match deadline {
        Some((at, duration)) => match timeout_at(at, started).await {
            Ok(ended) => ended,
            Err(_) => {
                warn!("Command {:?} timed out after {:?}", command, duration);
                channel.close().await;
                return Err(ClientError::Timeout { duration });
            }
        },
        None => started.await,
    };

    let outcome = match ended {
        Ok(StreamEnd::Eof) => {
            if collector.exit_code.is_none() {
                wait_exit_status(channel.as_mut(), &mut collector).await;
            }
            Ok(())
        }
        // Some servers skip the end-of-file but still report how the command exited.
        Ok(StreamEnd::Closed) if collector.exit_code.is_some() => Ok(()),
        Ok(StreamEnd::Closed) => Err(channel_lost(connection).await),
        Err(e) => Err(e),
    };
    channel.close().await;
    outcome?;

    let output = collector.finish();
    debug!("Command {:?} exited with {}", command, output.exit_code);
    Ok(output)
}

/// Send the request and collect events until end-of-file or close
async fn start_and_wait_eof(
    channel: &mut dyn SessionChannel,
    command: &str,
    collector: &mut OutputCollector,
) -> Result<StreamEnd> {
    channel.exec(command).await?;
    channel.send_eof().await?;

    while let Some(event) = channel.next_event().await {
        if let Some(end) = collector.record(event) {
            return Ok(end);
        }
    }
    Ok(StreamEnd::Closed)
}

/// Keep reading after end-of-file until the exit status or the close shows up
async fn wait_exit_status(channel: &mut dyn SessionChannel, collector: &mut OutputCollector) {
    let wait = async {
        while collector.exit_code.is_none() {
            match channel.next_event().await {
                Some(event) => {
                    if collector.record(event) == Some(StreamEnd::Closed) {
                        break;
                    }
                }
                None => break,
            }
        }
    };
    if tokio::time::timeout(EXIT_STATUS_GRACE, wait).await.is_err() {
        debug!("No exit status within {:?} of end-of-file", EXIT_STATUS_GRACE);
    }
}

/// Error for a channel that ended before its end-of-file
async fn channel_lost(connection: &Arc<dyn Connection>) -> ClientError {
    match tokio::time::timeout(EXIT_STATUS_GRACE, connection.closed()).await {
        Ok(TransportError::Closed(reason)) => ClientError::ConnectionLost(reason),
        Ok(other) => ClientError::ConnectionLost(other.to_string()),
        Err(_) => ClientError::ConnectionLost("channel closed before end of file".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tether_ssh::{ChannelOpenError, FileTransfer, TransportError};

    /// Connection handing out one scripted channel
    struct ScriptedConnection {
        events: Mutex<Option<Vec<ChannelEvent>>>,
        closed: Arc<Mutex<bool>>,
        /// Loss reason, when the connection has dropped
        lost: Option<String>,
    }

    struct ScriptedChannel {
        events: VecDeque<ChannelEvent>,
        closed: Arc<Mutex<bool>>,
    }

    impl ScriptedConnection {
        fn new(events: Vec<ChannelEvent>) -> (Arc<dyn Connection>, Arc<Mutex<bool>>) {
            Self::build(events, None)
        }

        /// A connection that dropped with `reason` while the channel was open
        fn lost(events: Vec<ChannelEvent>, reason: &str) -> (Arc<dyn Connection>, Arc<Mutex<bool>>) {
            Self::build(events, Some(reason.to_string()))
        }

        fn build(events: Vec<ChannelEvent>, lost: Option<String>) -> (Arc<dyn Connection>, Arc<Mutex<bool>>) {
            let closed = Arc::new(Mutex::new(false));
            let connection = Arc::new(Self {
                events: Mutex::new(Some(events)),
                closed: Arc::clone(&closed),
                lost,
            });
            (connection, closed)
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn open_session(&self) -> std::result::Result<Box<dyn SessionChannel>, ChannelOpenError> {
            let events = self
                .events
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| ChannelOpenError::Other("used".to_string()))?;
            Ok(Box::new(ScriptedChannel {
                events: events.into(),
                closed: Arc::clone(&self.closed),
            }))
        }

        async fn closed(&self) -> TransportError {
            match &self.lost {
                Some(reason) => TransportError::Closed(reason.clone()),
                None => std::future::pending().await,
            }
        }

        async fn disconnect(&self) {}

        fn is_closed(&self) -> bool {
            self.lost.is_some()
        }
    }

    #[async_trait]
    impl SessionChannel for ScriptedChannel {
        async fn exec(&mut self, _command: &str) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn send_eof(&mut self) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn next_event(&mut self) -> Option<ChannelEvent> {
            match self.events.pop_front() {
                Some(event) => Some(event),
                None => std::future::pending().await,
            }
        }

        async fn request_subsystem(&mut self, _name: &str) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn into_file_transfer(self: Box<Self>) -> std::result::Result<Arc<dyn FileTransfer>, TransportError> {
            Err(TransportError::Protocol("not a subsystem channel".to_string()))
        }

        async fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn data(text: &'static str) -> ChannelEvent {
        ChannelEvent::Data(Bytes::from_static(text.as_bytes()))
    }

    fn stderr(text: &'static str) -> ChannelEvent {
        ChannelEvent::ExtendedData {
            data_type: EXTENDED_DATA_STDERR,
            data: Bytes::from_static(text.as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_exit_status_after_eof() {
        let (connection, closed) = ScriptedConnection::new(vec![
            data("hel"),
            data("lo\n"),
            stderr("warning\n"),
            ChannelEvent::Eof,
            ChannelEvent::ExitStatus(3),
            ChannelEvent::Closed,
        ]);

        let output = run_command(&connection, "greet", None).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout_lossy(), "hello\n");
        assert_eq!(output.stderr_lossy(), "warning\n");
        assert!(!output.success());
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_missing_exit_status_defaults() {
        let (connection, _) = ScriptedConnection::new(vec![data("x"), ChannelEvent::Eof, ChannelEvent::Closed]);
        let output = run_command(&connection, "x", None).await.unwrap();
        assert_eq!(output.exit_code, UNKNOWN_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_other_extended_data_ignored() {
        let (connection, _) = ScriptedConnection::new(vec![
            ChannelEvent::ExtendedData {
                data_type: 7,
                data: Bytes::from_static(b"noise"),
            },
            ChannelEvent::ExitStatus(0),
            ChannelEvent::Closed,
        ]);
        let output = run_command(&connection, "x", None).await.unwrap();
        assert!(output.success());
        assert!(output.stdout.is_empty() && output.stderr.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_closes_channel() {
        let (connection, closed) = ScriptedConnection::new(vec![data("partial")]);
        let err = run_command(&connection, "sleep 100", Some(Duration::from_secs(3)))
            .await
            .unwrap_err();

        assert_eq!(err, ClientError::Timeout { duration: Duration::from_secs(3) });
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_at_eof_once_exit_status_is_known() {
        // The channel never closes; the command is done anyway.
        let (connection, closed) = ScriptedConnection::new(vec![
            data("hi\n"),
            ChannelEvent::ExitStatus(0),
            ChannelEvent::Eof,
        ]);
        let run = run_command(&connection, "echo hi", Some(Duration::from_secs(3)));
        let output = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("command resolved")
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout_lossy(), "hi\n");
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_exit_status_after_eof_waits_for_grace_only() {
        // Past the deadline the timer no longer applies; the grace period does.
        let (connection, closed) = ScriptedConnection::new(vec![data("x"), ChannelEvent::Eof]);
        let start = Instant::now();
        let output = run_command(&connection, "x", Some(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(output.exit_code, UNKNOWN_EXIT_CODE);
        assert_eq!(output.stdout_lossy(), "x");
        assert!(start.elapsed() >= EXIT_STATUS_GRACE);
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_close_before_eof_reports_connection_loss() {
        let (connection, closed) = ScriptedConnection::lost(
            vec![data("partial"), ChannelEvent::Closed],
            "Connection reset by peer",
        );

        let err = run_command(&connection, "x", None).await.unwrap_err();
        assert_eq!(err, ClientError::ConnectionLost("Connection reset by peer".to_string()));
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_vanished_channel_reports_connection_loss() {
        let (connection, _) = ScriptedConnection::lost(Vec::new(), "server went away");

        // A channel yielding nothing at all, as a dropped transport does.
        struct Gone;
        #[async_trait]
        impl SessionChannel for Gone {
            async fn exec(&mut self, _command: &str) -> std::result::Result<(), TransportError> {
                Ok(())
            }
            async fn send_eof(&mut self) -> std::result::Result<(), TransportError> {
                Ok(())
            }
            async fn next_event(&mut self) -> Option<ChannelEvent> {
                None
            }
            async fn request_subsystem(&mut self, _name: &str) -> std::result::Result<(), TransportError> {
                Ok(())
            }
            fn into_file_transfer(self: Box<Self>) -> std::result::Result<Arc<dyn FileTransfer>, TransportError> {
                Err(TransportError::Protocol("not a subsystem channel".to_string()))
            }
            async fn close(&mut self) {}
        }

        let mut collector = OutputCollector::default();
        let ended = start_and_wait_eof(&mut Gone, "x", &mut collector).await.unwrap();
        assert_eq!(ended, StreamEnd::Closed);
        assert_eq!(
            channel_lost(&connection).await,
            ClientError::ConnectionLost("server went away".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_before_eof_on_live_connection() {
        let (connection, _) = ScriptedConnection::new(vec![data("partial"), ChannelEvent::Closed]);
        let err = run_command(&connection, "x", None).await.unwrap_err();
        assert_eq!(
            err,
            ClientError::ConnectionLost("channel closed before end of file".to_string())
        );
    }

    #[tokio::test]
    async fn test_refused_channel() {
        let (connection, _) = ScriptedConnection::new(Vec::new());
        connection.open_session().await.ok();

        let err = run_command(&connection, "x", None).await.unwrap_err();
        assert_eq!(err, ClientError::ChannelOpen(ChannelOpenError::Other("used".to_string())));
    }
}
