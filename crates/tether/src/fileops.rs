//! Directory listing and attribute changes built on the transfer primitives

use crate::deadline::Deadline;
use crate::{ClientError, Result};
use glob::Pattern;
use std::sync::Arc;
use tether_ssh::{DirEntry, FileAttributes, FileTransfer, ServerStatus};
use tracing::debug;

/// List `path`, keeping only entries whose name matches `pattern`
///
/// Entries keep the order the server returned them in. The directory
/// handle is closed even when the deadline cuts the listing short.
pub async fn list_directory(
    sftp: &Arc<dyn FileTransfer>,
    path: &str,
    pattern: Option<&str>,
    deadline: Deadline,
) -> Result<Vec<DirEntry>> {
    let pattern = pattern
        .map(Pattern::new)
        .transpose()
        .map_err(|e| ClientError::Config(format!("Invalid glob pattern: {}", e)))?;

    let mut directory = deadline.run(sftp.open_directory(path)).await?;
    let mut entries = Vec::new();
    let outcome = deadline
        .run(async {
            loop {
                match directory.read().await {
                    Ok(batch) => entries.extend(batch),
                    Err(e) if e.is_eof() => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        })
        .await;
    let closed = Deadline::close(path, directory.close()).await;
    outcome?;
    closed?;

    debug!("Listed {} entries in {}", entries.len(), path);
    Ok(filter_entries(entries, pattern.as_ref()))
}

/// Drop entries whose file name does not match
pub fn filter_entries(entries: Vec<DirEntry>, pattern: Option<&Pattern>) -> Vec<DirEntry> {
    match pattern {
        Some(pattern) => entries
            .into_iter()
            .filter(|entry| pattern.matches(&entry.filename))
            .collect(),
        None => entries,
    }
}

/// Set the permission bits of `path`
pub async fn set_mode(sftp: &Arc<dyn FileTransfer>, path: &str, mode: u32) -> Result<ServerStatus> {
    let attrs = FileAttributes {
        permissions: Some(mode),
        ..Default::default()
    };
    Ok(sftp.set_attrs(path, attrs).await?)
}

/// Change the owner and/or group of `path`, keeping whichever is not given
pub async fn set_owner(
    sftp: &Arc<dyn FileTransfer>,
    path: &str,
    uid: Option<u32>,
    gid: Option<u32>,
) -> Result<ServerStatus> {
    let current = sftp.get_attrs(path, true).await?;
    let attrs = FileAttributes {
        uid: uid.or(current.uid),
        gid: gid.or(current.gid),
        ..Default::default()
    };
    Ok(sftp.set_attrs(path, attrs).await?)
}
