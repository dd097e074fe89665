//! Error types reported by an SSH engine

use thiserror::Error;
use std::io;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote host could not be reached
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// The server rejected the presented credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The client had no usable credentials to offer
    #[error("Authentication declined: {0}")]
    Declined(String),

    /// An established transport was closed
    #[error("Connection closed: {0}")]
    Closed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Reasons a server may refuse to open a channel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelOpenError {
    /// Refusal carrying an SSH reason code
    #[error("Channel open failed ({code}): {description}")]
    Protocol {
        /// SSH_MSG_CHANNEL_OPEN_FAILURE reason code
        code: u32,
        /// Server supplied description
        description: String,
    },

    /// Any other failure while opening the channel
    #[error("Channel open failed: {0}")]
    Other(String),
}

impl ChannelOpenError {
    /// Administratively prohibited
    pub const ADMINISTRATIVELY_PROHIBITED: u32 = 1;
    /// Connect failed
    pub const CONNECT_FAILED: u32 = 2;
    /// Unknown channel type
    pub const UNKNOWN_CHANNEL_TYPE: u32 = 3;
    /// Resource shortage
    pub const RESOURCE_SHORTAGE: u32 = 4;
}

/// File-transfer status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// End of file, or end of a directory listing
    Eof,
    /// Path does not exist
    NoSuchFile,
    /// Permission denied
    PermissionDenied,
    /// Generic failure
    Failure,
    /// Malformed request
    BadMessage,
    /// No file-transfer connection
    NoConnection,
    /// File-transfer connection lost
    ConnectionLost,
    /// Operation not supported by the server
    OpUnsupported,
}

impl StatusCode {
    /// Numeric code as sent on the wire
    pub fn as_u32(self) -> u32 {
        match self {
            StatusCode::Eof => 1,
            StatusCode::NoSuchFile => 2,
            StatusCode::PermissionDenied => 3,
            StatusCode::Failure => 4,
            StatusCode::BadMessage => 5,
            StatusCode::NoConnection => 6,
            StatusCode::ConnectionLost => 7,
            StatusCode::OpUnsupported => 8,
        }
    }
}

/// Failure reported by a file-transfer primitive
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (status {code:?})")]
pub struct SftpError {
    /// Status code
    pub code: StatusCode,
    /// Server supplied message
    pub message: String,
}

impl SftpError {
    /// Create a new error
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// End-of-file marker
    pub fn eof() -> Self {
        Self::new(StatusCode::Eof, "End of file")
    }

    /// Whether this is the end-of-file condition
    pub fn is_eof(&self) -> bool {
        self.code == StatusCode::Eof
    }
}

impl From<io::Error> for SftpError {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => StatusCode::NoSuchFile,
            io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
            io::ErrorKind::UnexpectedEof => StatusCode::Eof,
            _ => StatusCode::Failure,
        };
        Self::new(code, err.to_string())
    }
}
