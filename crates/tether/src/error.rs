//! Error types for the Tether client

use tether_ssh::{ChannelOpenError, SftpError, TransportError};
use thiserror::Error;
use std::time::Duration;

/// Error surfaced to callers of client operations
///
/// Cloneable so that a single connection loss can fail every operation that
/// was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The transport never reached the remote host
    #[error("Connect error: {0}")]
    Connect(String),

    /// Credentials were rejected or none were available
    #[error("Authentication error: {0}")]
    Auth(String),

    /// An established connection dropped
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// An operation or channel open exceeded its deadline
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// The server refused a channel
    #[error(transparent)]
    ChannelOpen(#[from] ChannelOpenError),

    /// The remote primitive reported a failure
    #[error("Remote operation failed: {0}")]
    Remote(#[from] SftpError),

    /// A download was requested for something that is not a regular file
    #[error("Not a regular file: {0}")]
    NotRegularFile(String),

    /// Reading or writing the local side of a transfer failed
    #[error("Local I/O error: {0}")]
    LocalIo(String),

    /// Invalid options
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel level protocol failure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The operation was dropped before it produced a result
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl ClientError {
    /// Whether this failure concerns the connection rather than one operation
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            ClientError::Connect(_) | ClientError::Auth(_) | ClientError::ConnectionLost(_)
        )
    }

    /// Whether this is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connection(msg) => Self::Connect(msg),
            TransportError::Authentication(msg) => Self::Auth(msg),
            TransportError::Declined(msg) => Self::Auth(msg),
            TransportError::Closed(msg) => Self::ConnectionLost(msg),
            TransportError::Io(e) => Self::Connect(e.to_string()),
            TransportError::Timeout => Self::Connect("transport timed out".to_string()),
            TransportError::Protocol(msg) => Self::Protocol(msg),
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::LocalIo(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_ssh::StatusCode;

    #[test]
    fn test_transport_error_mapping() {
        let err: ClientError = TransportError::Connection("refused".to_string()).into();
        assert_eq!(err, ClientError::Connect("refused".to_string()));
        assert!(err.is_connection_level());

        let err: ClientError = TransportError::Declined("no password".to_string()).into();
        assert!(matches!(err, ClientError::Auth(_)));

        let err: ClientError = TransportError::Closed("reset".to_string()).into();
        assert_eq!(err, ClientError::ConnectionLost("reset".to_string()));
    }

    #[test]
    fn test_operation_level_errors() {
        let err: ClientError = SftpError::new(StatusCode::NoSuchFile, "missing").into();
        assert!(!err.is_connection_level());

        let err = ClientError::Timeout { duration: Duration::from_secs(3) };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Timeout after 3s");

        let err: ClientError = ChannelOpenError::Other("busy".to_string()).into();
        assert_eq!(err.to_string(), "Channel open failed: busy");
    }
}
