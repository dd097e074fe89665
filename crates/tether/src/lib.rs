//! # Tether
//!
//! A reconnecting SSH client for programs that talk to one remote host for
//! a long time.
//!
//! Tether keeps a single authenticated connection alive, reconnecting with
//! a bounded exponential backoff whenever it drops. Commands and file
//! operations can be issued at any time: each returns a future that resolves
//! exactly once, either with its result or with the reason the connection it
//! was waiting on went away. Downloads and uploads move files in chunks over
//! a file-transfer channel shared by all file operations of a connection.
//!
//! The SSH protocol itself is supplied by an [`ssh::SshEngine`]
//! implementation; see the `tether-ssh` crate.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use tether_ssh as ssh;

/// Error types for the Tether client
pub mod error;

/// Connection options and reconnect policy
pub mod config;

/// Reconnect delay calculation
pub mod backoff;

/// Registry of in-flight operations
pub mod tracker;

/// Connection lifecycle and epochs
pub mod lifecycle;

/// Time limits for remote work
pub mod deadline;

/// Remote command execution
pub mod exec;

/// Per-epoch file-transfer channel
pub mod sftp;

/// Byte-range bookkeeping for downloads
pub mod chunk;

/// Chunked downloads and uploads
pub mod transfer;

/// Directory listing and attribute helpers
pub mod fileops;

/// Public client API
pub mod client;

pub use client::{ClientBuilder, SshClient};
pub use config::{ConnectionOptions, ReconnectPolicy};
pub use error::ClientError;
pub use exec::CommandOutput;
pub use lifecycle::{Epoch, LinkState};
pub use tracker::Pending;
pub use transfer::TransferSummary;

/// Result type alias for Tether operations
pub type Result<T> = std::result::Result<T, ClientError>;
