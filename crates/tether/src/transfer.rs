//! Chunked file transfer over a file-transfer handle
//!
//! Downloads keep up to `max_requests` chunk reads in flight and write each
//! reply at its offset as it arrives; uploads send one chunk at a time.
//! Both always close the remote file handle, also on failure or timeout.

use crate::chunk::{Chunk, ChunkMap};
use crate::deadline::Deadline;
use crate::{ClientError, Result};
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tether_ssh::{FileAttributes, FileTransfer, OpenFlags, RemoteFile, SftpError};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Outcome of a completed transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    /// Bytes moved
    pub bytes: u64,
    /// Chunks that carried data
    pub chunks: u64,
}

/// Copy the remote file at `remote` to the local path `local`
pub async fn download(
    sftp: &Arc<dyn FileTransfer>,
    remote: &str,
    local: &Path,
    buffer_size: u32,
    max_requests: usize,
    deadline: Deadline,
) -> Result<TransferSummary> {
    let attrs = deadline.run(sftp.get_attrs(remote, true)).await?;
    // Servers that omit permissions get the benefit of the doubt.
    if attrs.file_type().is_some() && !attrs.is_regular_file() {
        return Err(ClientError::NotRegularFile(remote.to_string()));
    }

    let remote_file = deadline
        .run(sftp.open_file(remote, OpenFlags::read(), FileAttributes::default()))
        .await?;

    let result = deadline
        .run(fetch_into(remote_file.as_ref(), local, buffer_size, max_requests.max(1)))
        .await;

    let closed = Deadline::close(remote, remote_file.close()).await;
    let summary = result?;
    closed?;

    debug!(
        "Downloaded {} ({} bytes in {} chunks)",
        remote, summary.bytes, summary.chunks
    );
    Ok(summary)
}

/// Copy the local file at `local` to the remote path `remote`
pub async fn upload(
    sftp: &Arc<dyn FileTransfer>,
    local: &Path,
    remote: &str,
    buffer_size: u32,
    deadline: Deadline,
) -> Result<TransferSummary> {
    let mut local_file = File::open(local)
        .await
        .map_err(|e| ClientError::LocalIo(format!("cannot open {}: {}", local.display(), e)))?;

    let remote_file = deadline
        .run(sftp.open_file(remote, OpenFlags::write_truncate(), FileAttributes::default()))
        .await?;

    let result = deadline
        .run(send_chunks(&mut local_file, remote_file.as_ref(), buffer_size))
        .await;

    let closed = Deadline::close(remote, remote_file.close()).await;
    let summary = result?;
    closed?;

    debug!(
        "Uploaded {} ({} bytes in {} chunks)",
        remote, summary.bytes, summary.chunks
    );
    Ok(summary)
}

async fn fetch_into(
    remote: &dyn RemoteFile,
    local: &Path,
    buffer_size: u32,
    max_requests: usize,
) -> Result<TransferSummary> {
    let mut local_file = File::create(local)
        .await
        .map_err(|e| ClientError::LocalIo(format!("cannot create {}: {}", local.display(), e)))?;
    fetch_chunks(remote, &mut local_file, buffer_size, max_requests).await
}

async fn fetch_chunks(
    remote: &dyn RemoteFile,
    local: &mut File,
    buffer_size: u32,
    max_requests: usize,
) -> Result<TransferSummary> {
    let mut chunks = ChunkMap::new();
    let mut in_flight = FuturesUnordered::new();
    let mut summary = TransferSummary::default();

    loop {
        while in_flight.len() < max_requests {
            let Some(chunk) = chunks.next_chunk(buffer_size) else {
                break;
            };
            in_flight.push(read_chunk(remote, chunk));
        }

        let Some((chunk, reply)) = in_flight.next().await else {
            break;
        };

        match reply {
            Ok(data) if data.is_empty() => chunks.record_eof(chunk),
            Ok(data) => {
                let data = data.slice(..data.len().min(chunk.length as usize));
                local.seek(SeekFrom::Start(chunk.offset)).await?;
                local.write_all(&data).await?;

                chunks.record_data(chunk, data.len());
                summary.bytes += data.len() as u64;
                summary.chunks += 1;
            }
            Err(e) if e.is_eof() => chunks.record_eof(chunk),
            Err(e) => {
                warn!("Read of {} failed: {}", chunk, e);
                return Err(e.into());
            }
        }
    }

    local.set_len(chunks.frontier()).await?;
    local.flush().await?;
    Ok(summary)
}

async fn read_chunk(remote: &dyn RemoteFile, chunk: Chunk) -> (Chunk, std::result::Result<Bytes, SftpError>) {
    (chunk, remote.read_chunk(chunk.offset, chunk.length).await)
}

async fn send_chunks(
    local: &mut File,
    remote: &dyn RemoteFile,
    buffer_size: u32,
) -> Result<TransferSummary> {
    let mut buf = vec![0u8; buffer_size as usize];
    let mut summary = TransferSummary::default();

    loop {
        let n = fill(local, &mut buf).await?;
        if n == 0 {
            break;
        }
        remote
            .write_chunk(summary.bytes, Bytes::copy_from_slice(&buf[..n]))
            .await?;
        summary.bytes += n as u64;
        summary.chunks += 1;
    }
    Ok(summary)
}

/// Read until `buf` is full or the file ends
async fn fill(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
