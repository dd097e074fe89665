//! # Tether SSH
//!
//! The contract between the Tether client and an SSH implementation: how a
//! transport is opened and authenticated, how session channels run commands
//! or the file-transfer subsystem, and which file primitives that subsystem
//! offers.

#![warn(missing_docs)]

/// Engine, transport and connection abstractions
pub mod engine;

/// Session channels
pub mod channel;

/// File-transfer primitives
pub mod sftp;

/// Engine-specific error types
pub mod error;

/// In-process engine backed by the local machine
#[cfg(all(feature = "loopback", unix))]
pub mod loopback;

/// Engine for real SSH servers, built on `russh`
#[cfg(feature = "russh")]
pub mod russh_engine;

pub use engine::{SshEngine, Transport, Connection, Credentials};
pub use channel::{SessionChannel, ChannelEvent, EXTENDED_DATA_STDERR};
pub use sftp::{
    FileTransfer, RemoteFile, RemoteDirectory, FileAttributes, DirEntry, ServerStatus, OpenFlags,
    S_IFMT, S_IFREG, S_IFDIR, S_IFLNK,
};
pub use error::{TransportError, ChannelOpenError, SftpError, StatusCode};
