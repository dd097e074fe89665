//! File-transfer primitives and value types

use async_trait::async_trait;
use bytes::Bytes;
use crate::SftpError;
use serde::{Deserialize, Serialize};

/// File type bits of `permissions`
pub const S_IFMT: u32 = 0o170000;
/// Regular file
pub const S_IFREG: u32 = 0o100000;
/// Directory
pub const S_IFDIR: u32 = 0o040000;
/// Symbolic link
pub const S_IFLNK: u32 = 0o120000;

/// Attributes of a remote file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    /// Size in bytes
    pub size: Option<u64>,
    /// Owner user id
    pub uid: Option<u32>,
    /// Owner group id
    pub gid: Option<u32>,
    /// Mode bits, including the file type
    pub permissions: Option<u32>,
    /// Access time (seconds since the epoch)
    pub atime: Option<u32>,
    /// Modification time (seconds since the epoch)
    pub mtime: Option<u32>,
}

impl FileAttributes {
    /// File type bits, if permissions are known
    pub fn file_type(&self) -> Option<u32> {
        self.permissions.map(|p| p & S_IFMT)
    }

    /// Whether these attributes describe a regular file
    pub fn is_regular_file(&self) -> bool {
        self.file_type() == Some(S_IFREG)
    }

    /// Whether these attributes describe a directory
    pub fn is_dir(&self) -> bool {
        self.file_type() == Some(S_IFDIR)
    }

    /// Whether these attributes describe a symbolic link
    pub fn is_symlink(&self) -> bool {
        self.file_type() == Some(S_IFLNK)
    }
}

/// A directory entry as returned by a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Bare file name
    pub filename: String,
    /// `ls -l` style long name
    pub longname: String,
    /// File attributes
    pub attrs: FileAttributes,
}

/// Status message returned by a successful mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Human readable message
    pub message: String,
    /// Language tag of the message
    pub language: String,
}

impl ServerStatus {
    /// Create a status with an empty language tag
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            language: String::new(),
        }
    }
}

/// Flags used when opening a remote file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Open for reading
    pub read: bool,
    /// Open for writing
    pub write: bool,
    /// Append to the end
    pub append: bool,
    /// Create if missing
    pub create: bool,
    /// Truncate on open
    pub truncate: bool,
    /// Fail if the file exists
    pub exclusive: bool,
}

impl OpenFlags {
    /// Read only
    pub fn read() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    /// Write, creating or truncating the file
    pub fn write_truncate() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }
}

/// File-transfer client bound to one channel
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Open a remote file
    async fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Box<dyn RemoteFile>, SftpError>;

    /// Open a remote directory for listing
    async fn open_directory(&self, path: &str) -> Result<Box<dyn RemoteDirectory>, SftpError>;

    /// Read attributes of a path
    async fn get_attrs(&self, path: &str, follow_links: bool) -> Result<FileAttributes, SftpError>;

    /// Change attributes of a path; only the fields that are set are applied
    async fn set_attrs(&self, path: &str, attrs: FileAttributes) -> Result<ServerStatus, SftpError>;

    /// Create a directory
    async fn make_directory(&self, path: &str, attrs: FileAttributes) -> Result<ServerStatus, SftpError>;

    /// Remove an empty directory
    async fn remove_directory(&self, path: &str) -> Result<ServerStatus, SftpError>;

    /// Remove a file
    async fn remove_file(&self, path: &str) -> Result<ServerStatus, SftpError>;

    /// Rename a file or directory
    async fn rename_file(&self, old_path: &str, new_path: &str) -> Result<ServerStatus, SftpError>;

    /// Create a symbolic link at `link_path` pointing to `target_path`
    async fn make_link(&self, link_path: &str, target_path: &str) -> Result<ServerStatus, SftpError>;

    /// Close the underlying channel
    async fn close(&self);
}

/// An open remote file
#[async_trait]
pub trait RemoteFile: Send + Sync {
    /// Read up to `length` bytes at `offset`; fails with EOF past the end
    async fn read_chunk(&self, offset: u64, length: u32) -> Result<Bytes, SftpError>;

    /// Write `data` at `offset`
    async fn write_chunk(&self, offset: u64, data: Bytes) -> Result<(), SftpError>;

    /// Attributes of the open file
    async fn get_attrs(&self) -> Result<FileAttributes, SftpError>;

    /// Close the handle
    async fn close(&self) -> Result<(), SftpError>;
}

/// An open remote directory
#[async_trait]
pub trait RemoteDirectory: Send {
    /// Next batch of entries; fails with EOF once exhausted
    async fn read(&mut self) -> Result<Vec<DirEntry>, SftpError>;

    /// Close the handle
    async fn close(&mut self) -> Result<(), SftpError>;
}
