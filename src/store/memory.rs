//! In-memory implementation of the store capability interface.
//!
//! Modification timestamps come from a logical clock that advances on every
//! write, so two writes never share a timestamp. Handles to removed resources
//! go stale and fail with `NotFound`, like handles into a real store would.
//!
//! Besides the handle interface, `MemoryStore` exposes fixture helpers that
//! edit the tree behind the mirror's back (root-relative paths such as
//! `"sub/b.txt"`), which is how tests simulate external changes.

use super::{
    AccessMode, DirRef, DirectoryHandle, FileHandle, FileMetadata, FileRef, Handle,
    PermissionState, WritableFile,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Base of the logical clock (2023-11-14T22:13:20Z).
const CLOCK_BASE_SECS: u64 = 1_700_000_000;

#[derive(Debug)]
struct Shared {
    clock: AtomicU64,
    permission: Mutex<PermissionState>,
    read_only: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicU64,
}

impl Shared {
    fn tick(&self) -> SystemTime {
        let step = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        UNIX_EPOCH + Duration::from_secs(CLOCK_BASE_SECS) + Duration::from_millis(step)
    }
}

#[derive(Debug)]
struct FileNode {
    data: Vec<u8>,
    modified: SystemTime,
    removed: bool,
}

#[derive(Debug, Default)]
struct DirNode {
    children: BTreeMap<String, Node>,
    removed: bool,
    unreadable: bool,
}

#[derive(Debug, Clone)]
enum Node {
    File(Arc<Mutex<FileNode>>),
    Dir(Arc<Mutex<DirNode>>),
}

impl Node {
    fn mark_removed(&self) {
        match self {
            Node::File(file) => file.lock().removed = true,
            Node::Dir(dir) => {
                let mut dir = dir.lock();
                dir.removed = true;
                for child in dir.children.values() {
                    child.mark_removed();
                }
            }
        }
    }
}

fn not_found(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{name} does not exist"))
}

fn stale(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{name} was removed"))
}

/// An in-memory hierarchical store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    root_name: String,
    root: Arc<Mutex<DirNode>>,
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty store whose root directory is called `root_name`.
    pub fn new(root_name: impl Into<String>) -> Self {
        Self {
            root_name: root_name.into(),
            root: Arc::new(Mutex::new(DirNode::default())),
            shared: Arc::new(Shared {
                clock: AtomicU64::new(0),
                permission: Mutex::new(PermissionState::Granted),
                read_only: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                reads: AtomicU64::new(0),
            }),
        }
    }

    /// Handle to the root directory.
    pub fn root(&self) -> DirRef {
        Arc::new(MemoryDirectory {
            name: self.root_name.clone(),
            node: Arc::clone(&self.root),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Answer every permission query with `state`.
    pub fn set_permission(&self, state: PermissionState) {
        *self.shared.permission.lock() = state;
    }

    /// Grant only read access; read-write queries are denied.
    pub fn set_read_only(&self, read_only: bool) {
        self.shared.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Make every writable stream fail on `write`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make enumeration of the directory at `path` fail.
    pub fn set_unreadable(&self, path: &str, unreadable: bool) {
        if let Some(dir) = self.dir_node(path, false) {
            dir.lock().unreadable = unreadable;
        }
    }

    /// Number of file content reads served so far.
    pub fn read_count(&self) -> u64 {
        self.shared.reads.load(Ordering::SeqCst)
    }

    /// Write a file, creating missing parent directories.
    pub fn write_file(&self, path: &str, data: impl AsRef<[u8]>) {
        let (parent, name) = split_relative(path);
        let Some(dir) = self.dir_node(parent, true) else {
            return;
        };
        let modified = self.shared.tick();
        let mut dir = dir.lock();
        match dir.children.get(name) {
            Some(Node::File(file)) => {
                let mut file = file.lock();
                file.data = data.as_ref().to_vec();
                file.modified = modified;
            }
            _ => {
                dir.children.insert(
                    name.to_string(),
                    Node::File(Arc::new(Mutex::new(FileNode {
                        data: data.as_ref().to_vec(),
                        modified,
                        removed: false,
                    }))),
                );
            }
        }
    }

    /// Create a directory and any missing parents.
    pub fn create_dir(&self, path: &str) {
        self.dir_node(path, true);
    }

    /// Remove a file or directory (recursively). Returns whether it existed.
    pub fn remove(&self, path: &str) -> bool {
        let (parent, name) = split_relative(path);
        let Some(dir) = self.dir_node(parent, false) else {
            return false;
        };
        let removed = dir.lock().children.remove(name);
        match removed {
            Some(node) => {
                node.mark_removed();
                true
            }
            None => false,
        }
    }

    /// Content of the file at `path`, if there is one.
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        let (parent, name) = split_relative(path);
        let dir = self.dir_node(parent, false)?;
        let dir = dir.lock();
        match dir.children.get(name)? {
            Node::File(file) => Some(file.lock().data.clone()),
            Node::Dir(_) => None,
        }
    }

    /// Whether anything exists at `path`. The empty path is the root.
    pub fn exists(&self, path: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        let (parent, name) = split_relative(path);
        self.dir_node(parent, false)
            .map(|dir| dir.lock().children.contains_key(name))
            .unwrap_or(false)
    }

    /// Whether `path` is a directory.
    pub fn is_dir(&self, path: &str) -> bool {
        path.is_empty() || self.dir_node(path, false).is_some()
    }

    fn dir_node(&self, path: &str, create: bool) -> Option<Arc<Mutex<DirNode>>> {
        let mut current = Arc::clone(&self.root);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let next = {
                let mut dir = current.lock();
                match dir.children.get(segment) {
                    Some(Node::Dir(child)) => Arc::clone(child),
                    Some(Node::File(_)) => return None,
                    None if create => {
                        let child = Arc::new(Mutex::new(DirNode::default()));
                        dir.children
                            .insert(segment.to_string(), Node::Dir(Arc::clone(&child)));
                        child
                    }
                    None => return None,
                }
            };
            current = next;
        }
        Some(current)
    }
}

fn split_relative(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

#[derive(Debug)]
struct MemoryDirectory {
    name: String,
    node: Arc<Mutex<DirNode>>,
    shared: Arc<Shared>,
}

impl MemoryDirectory {
    fn handle_for(&self, name: &str, node: &Node) -> Handle {
        match node {
            Node::File(file) => Handle::File(Arc::new(MemoryFile {
                name: name.to_string(),
                node: Arc::clone(file),
                shared: Arc::clone(&self.shared),
            })),
            Node::Dir(dir) => Handle::Directory(Arc::new(MemoryDirectory {
                name: name.to_string(),
                node: Arc::clone(dir),
                shared: Arc::clone(&self.shared),
            })),
        }
    }
}

#[async_trait]
impl DirectoryHandle for MemoryDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn entries(&self) -> io::Result<Vec<Handle>> {
        let dir = self.node.lock();
        if dir.removed {
            return Err(stale(&self.name));
        }
        if dir.unreadable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("cannot list {}", self.name),
            ));
        }
        Ok(dir
            .children
            .iter()
            .map(|(name, node)| self.handle_for(name, node))
            .collect())
    }

    async fn file(&self, name: &str, create: bool) -> io::Result<FileRef> {
        let mut dir = self.node.lock();
        if dir.removed {
            return Err(stale(&self.name));
        }
        let node = match dir.children.get(name) {
            Some(Node::File(file)) => Arc::clone(file),
            Some(Node::Dir(_)) => {
                return Err(io::Error::other(format!("{name} is a directory")));
            }
            None if create => {
                let file = Arc::new(Mutex::new(FileNode {
                    data: Vec::new(),
                    modified: self.shared.tick(),
                    removed: false,
                }));
                dir.children
                    .insert(name.to_string(), Node::File(Arc::clone(&file)));
                file
            }
            None => return Err(not_found(name)),
        };
        Ok(Arc::new(MemoryFile {
            name: name.to_string(),
            node,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn directory(&self, name: &str, create: bool) -> io::Result<DirRef> {
        let mut dir = self.node.lock();
        if dir.removed {
            return Err(stale(&self.name));
        }
        let node = match dir.children.get(name) {
            Some(Node::Dir(child)) => Arc::clone(child),
            Some(Node::File(_)) => {
                return Err(io::Error::other(format!("{name} is a file")));
            }
            None if create => {
                let child = Arc::new(Mutex::new(DirNode::default()));
                dir.children
                    .insert(name.to_string(), Node::Dir(Arc::clone(&child)));
                child
            }
            None => return Err(not_found(name)),
        };
        Ok(Arc::new(MemoryDirectory {
            name: name.to_string(),
            node,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn remove_entry(&self, name: &str, recursive: bool) -> io::Result<()> {
        let mut dir = self.node.lock();
        if dir.removed {
            return Err(stale(&self.name));
        }
        match dir.children.get(name) {
            None => return Err(not_found(name)),
            Some(Node::Dir(child)) if !recursive && !child.lock().children.is_empty() => {
                return Err(io::Error::other(format!("{name} is not empty")));
            }
            Some(_) => {}
        }
        if let Some(node) = dir.children.remove(name) {
            node.mark_removed();
        }
        Ok(())
    }

    async fn query_permission(&self, mode: AccessMode) -> PermissionState {
        if mode == AccessMode::ReadWrite && self.shared.read_only.load(Ordering::SeqCst) {
            return PermissionState::Denied;
        }
        *self.shared.permission.lock()
    }
}

#[derive(Debug)]
struct MemoryFile {
    name: String,
    node: Arc<Mutex<FileNode>>,
    shared: Arc<Shared>,
}

#[async_trait]
impl FileHandle for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn metadata(&self) -> io::Result<FileMetadata> {
        let file = self.node.lock();
        if file.removed {
            return Err(stale(&self.name));
        }
        Ok(FileMetadata {
            size: file.data.len() as u64,
            last_modified: file.modified,
        })
    }

    async fn read(&self) -> io::Result<Vec<u8>> {
        let file = self.node.lock();
        if file.removed {
            return Err(stale(&self.name));
        }
        self.shared.reads.fetch_add(1, Ordering::SeqCst);
        Ok(file.data.clone())
    }

    async fn create_writable(&self) -> io::Result<Box<dyn WritableFile>> {
        if self.node.lock().removed {
            return Err(stale(&self.name));
        }
        Ok(Box::new(MemoryWritable {
            name: self.name.clone(),
            node: Arc::clone(&self.node),
            shared: Arc::clone(&self.shared),
            buffer: Vec::new(),
        }))
    }
}

struct MemoryWritable {
    name: String,
    node: Arc<Mutex<FileNode>>,
    shared: Arc<Shared>,
    buffer: Vec<u8>,
}

#[async_trait]
impl WritableFile for MemoryWritable {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other(format!("write to {} rejected", self.name)));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        let modified = self.shared.tick();
        let mut file = self.node.lock();
        if file.removed {
            return Err(stale(&self.name));
        }
        file.data = std::mem::take(&mut self.buffer);
        file.modified = modified;
        Ok(())
    }

    async fn abort(&mut self) -> io::Result<()> {
        self.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixture_and_handles_agree() {
        let store = MemoryStore::new("root");
        store.write_file("sub/b.txt", "hello");

        let root = store.root();
        let entries = root.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_dir());

        let sub = root.directory("sub", false).await.unwrap();
        let file = sub.file("b.txt", false).await.unwrap();
        assert_eq!(file.read().await.unwrap(), b"hello");
        assert_eq!(file.metadata().await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn test_writes_advance_clock() {
        let store = MemoryStore::new("root");
        store.write_file("a.txt", "one");
        let file = store.root().file("a.txt", false).await.unwrap();
        let before = file.metadata().await.unwrap().last_modified;

        store.write_file("a.txt", "two");
        let after = file.metadata().await.unwrap().last_modified;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_aborted_stream_leaves_content() {
        let store = MemoryStore::new("root");
        store.write_file("a.txt", "keep");
        let file = store.root().file("a.txt", false).await.unwrap();

        let mut stream = file.create_writable().await.unwrap();
        stream.write(b"discard").await.unwrap();
        stream.abort().await.unwrap();

        assert_eq!(store.read_file("a.txt").unwrap(), b"keep");
    }

    #[tokio::test]
    async fn test_removed_handles_go_stale() {
        let store = MemoryStore::new("root");
        store.write_file("dir/a.txt", "x");
        let dir = store.root().directory("dir", false).await.unwrap();
        let file = dir.file("a.txt", false).await.unwrap();

        let err = store.root().remove_entry("dir", false).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);

        store.root().remove_entry("dir", true).await.unwrap();
        assert_eq!(file.read().await.unwrap_err().kind(), io::ErrorKind::NotFound);
        assert!(dir.entries().await.is_err());
        assert!(!store.exists("dir"));
    }

    #[tokio::test]
    async fn test_missing_child_without_create() {
        let store = MemoryStore::new("root");
        let err = store.root().file("nope.txt", false).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_permissions() {
        let store = MemoryStore::new("root");
        let root = store.root();
        assert_eq!(root.query_permission(AccessMode::ReadWrite).await, PermissionState::Granted);

        store.set_read_only(true);
        assert_eq!(root.query_permission(AccessMode::Read).await, PermissionState::Granted);
        assert_eq!(root.query_permission(AccessMode::ReadWrite).await, PermissionState::Denied);
    }
}
