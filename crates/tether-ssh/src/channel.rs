//! Session channels multiplexed over a connection

use async_trait::async_trait;
use bytes::Bytes;
use crate::{FileTransfer, TransportError};
use std::sync::Arc;

/// Extended data type carrying standard error
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Event delivered by a session channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Standard output data
    Data(Bytes),
    /// Extended data, standard error when `data_type` is [`EXTENDED_DATA_STDERR`]
    ExtendedData {
        /// Extended data type code
        data_type: u32,
        /// Payload
        data: Bytes,
    },
    /// Exit status of the remote command
    ExitStatus(u32),
    /// The remote side will send no more data
    Eof,
    /// The channel has been closed
    Closed,
}

/// A session channel opened on an authenticated connection
#[async_trait]
pub trait SessionChannel: Send {
    /// Send an `exec` request and wait for the server to acknowledge it
    async fn exec(&mut self, command: &str) -> Result<(), TransportError>;

    /// Signal that no more input will be sent
    async fn send_eof(&mut self) -> Result<(), TransportError>;

    /// Wait for the next event, `None` once the channel is gone
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    /// Request a subsystem (e.g. `sftp`) and wait for the acknowledgement
    async fn request_subsystem(&mut self, name: &str) -> Result<(), TransportError>;

    /// Turn a channel running the `sftp` subsystem into a file-transfer client
    fn into_file_transfer(self: Box<Self>) -> Result<Arc<dyn FileTransfer>, TransportError>;

    /// Close the channel, releasing server side resources
    async fn close(&mut self);
}
