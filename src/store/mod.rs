//! Capability interface to the external hierarchical store.
//!
//! The mirror never addresses the store by path string. Every read, write and
//! enumeration goes through an opaque handle obtained from a parent handle,
//! starting at the root directory handed over by the root acquisition
//! collaborator.
//!
//! - `memory`: in-memory store used by tests and embedders
//! - `local`: adapter over a directory on the local filesystem

pub mod local;
pub mod memory;

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

pub use local::LocalStore;
pub use memory::MemoryStore;

/// Access mode granted for a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Enumerate and read only.
    Read,
    /// Read plus create, write and remove.
    ReadWrite,
}

/// Result of a permission query against a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionState {
    /// Access is available.
    Granted,
    /// Access was refused.
    Denied,
    /// The user has not decided yet. Treated as not granted.
    Prompt,
}

/// Metadata reported by the store for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    /// Size in bytes.
    pub size: u64,
    /// Last modification timestamp, used for change detection.
    pub last_modified: SystemTime,
}

/// Handle to a single file resource.
#[async_trait]
pub trait FileHandle: fmt::Debug + Send + Sync {
    /// The file's name within its parent.
    fn name(&self) -> &str;

    /// Current size and modification timestamp.
    async fn metadata(&self) -> io::Result<FileMetadata>;

    /// Read the whole file.
    async fn read(&self) -> io::Result<Vec<u8>>;

    /// Open a writable stream that replaces the file content on `close`.
    async fn create_writable(&self) -> io::Result<Box<dyn WritableFile>>;
}

/// A scoped, revocable write stream.
///
/// Nothing is visible in the store until `close` succeeds; `abort` discards
/// everything written so far.
#[async_trait]
pub trait WritableFile: Send {
    /// Append `data` to the pending content.
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Commit the pending content.
    async fn close(&mut self) -> io::Result<()>;

    /// Discard the pending content.
    async fn abort(&mut self) -> io::Result<()>;
}

/// Handle to a single directory resource.
#[async_trait]
pub trait DirectoryHandle: fmt::Debug + Send + Sync {
    /// The directory's name within its parent. For a root, its display name.
    fn name(&self) -> &str;

    /// List the immediate children.
    async fn entries(&self) -> io::Result<Vec<Handle>>;

    /// Resolve a child file, creating it when `create` is set.
    async fn file(&self, name: &str, create: bool) -> io::Result<FileRef>;

    /// Resolve a child directory, creating it when `create` is set.
    async fn directory(&self, name: &str, create: bool) -> io::Result<DirRef>;

    /// Remove a child. Non-empty directories fail unless `recursive` is set.
    async fn remove_entry(&self, name: &str, recursive: bool) -> io::Result<()>;

    /// Current permission for `mode`.
    async fn query_permission(&self, mode: AccessMode) -> PermissionState;
}

/// Shared file handle.
pub type FileRef = Arc<dyn FileHandle>;
/// Shared directory handle.
pub type DirRef = Arc<dyn DirectoryHandle>;

/// Either kind of handle, as returned by directory enumeration.
#[derive(Debug, Clone)]
pub enum Handle {
    /// A file.
    File(FileRef),
    /// A directory.
    Directory(DirRef),
}

impl Handle {
    /// The resource's name within its parent.
    pub fn name(&self) -> &str {
        match self {
            Handle::File(file) => file.name(),
            Handle::Directory(dir) => dir.name(),
        }
    }

    /// Whether this is a directory handle.
    pub fn is_dir(&self) -> bool {
        matches!(self, Handle::Directory(_))
    }
}

/// Collect the names of a directory's immediate children.
pub(crate) async fn child_names(dir: &DirRef) -> io::Result<Vec<String>> {
    Ok(dir
        .entries()
        .await?
        .iter()
        .map(|handle| handle.name().to_string())
        .collect())
}
