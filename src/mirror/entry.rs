//! Entry records and path helpers.
//!
//! Paths are `/`-joined names starting at the root directory's own name, so
//! the root's path is a bare name such as `"project"` and a child is
//! `"project/src/main.rs"`.

use crate::store::{DirRef, FileMetadata, FileRef, Handle};
use std::time::SystemTime;

/// Metadata and (optionally) content of a mirrored file.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Last path segment.
    pub name: String,
    /// Full path from the root.
    pub path: String,
    /// Handle the entry was enumerated through.
    pub handle: FileRef,
    /// File size in bytes.
    pub size: u64,
    /// Modification timestamp at the last enumeration.
    pub last_modified: SystemTime,
    /// MIME type guessed from the file name.
    pub content_type: String,
    /// Loaded text; present exactly when `opened` is set.
    pub content: Option<String>,
    /// Whether the file has been opened and its content is tracked.
    pub opened: bool,
}

impl FileEntry {
    /// Build a closed file entry from store metadata.
    pub fn new(path: String, handle: FileRef, metadata: FileMetadata) -> Self {
        let name = file_name(&path).to_string();
        Self {
            content_type: content_type_for(&name),
            name,
            path,
            handle,
            size: metadata.size,
            last_modified: metadata.last_modified,
            content: None,
            opened: false,
        }
    }

    /// Refresh size and timestamp in place.
    pub fn apply_metadata(&mut self, metadata: FileMetadata) {
        self.size = metadata.size;
        self.last_modified = metadata.last_modified;
    }

    /// Mark the file opened with `content`.
    pub fn open_with(&mut self, content: String) {
        self.content = Some(content);
        self.opened = true;
    }

    /// Drop the content and mark the file closed.
    pub fn close(&mut self) {
        self.content = None;
        self.opened = false;
    }
}

/// A mirrored directory.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    /// Last path segment.
    pub name: String,
    /// Full path from the root.
    pub path: String,
    /// Handle used to enumerate the directory.
    pub handle: DirRef,
    /// Whether every immediate child has been enumerated into the index.
    pub loaded: bool,
}

impl DirectoryEntry {
    /// Create a directory entry at `path`.
    pub fn new(path: String, handle: DirRef, loaded: bool) -> Self {
        Self {
            name: file_name(&path).to_string(),
            path,
            handle,
            loaded,
        }
    }
}

/// A file or directory record keyed by its path.
#[derive(Debug, Clone)]
pub enum Entry {
    /// A file.
    File(FileEntry),
    /// A directory.
    Directory(DirectoryEntry),
}

impl Entry {
    /// Full path from the root.
    pub fn path(&self) -> &str {
        match self {
            Entry::File(file) => &file.path,
            Entry::Directory(dir) => &dir.path,
        }
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        match self {
            Entry::File(file) => &file.name,
            Entry::Directory(dir) => &dir.name,
        }
    }

    /// Whether this is a directory entry.
    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Directory(_))
    }

    /// The entry's store handle.
    pub fn handle(&self) -> Handle {
        match self {
            Entry::File(file) => Handle::File(file.handle.clone()),
            Entry::Directory(dir) => Handle::Directory(dir.handle.clone()),
        }
    }

    /// The file record, if this is a file.
    pub fn as_file(&self) -> Option<&FileEntry> {
        match self {
            Entry::File(file) => Some(file),
            Entry::Directory(_) => None,
        }
    }

    /// Mutable access to the file record, if this is a file.
    pub fn as_file_mut(&mut self) -> Option<&mut FileEntry> {
        match self {
            Entry::File(file) => Some(file),
            Entry::Directory(_) => None,
        }
    }

    /// The directory record, if this is a directory.
    pub fn as_directory(&self) -> Option<&DirectoryEntry> {
        match self {
            Entry::Directory(dir) => Some(dir),
            Entry::File(_) => None,
        }
    }

    /// `true` for a directory whose children are in the index.
    pub fn is_loaded_dir(&self) -> bool {
        matches!(self, Entry::Directory(dir) if dir.loaded)
    }

    /// `true` for a file whose content is tracked.
    pub fn is_opened_file(&self) -> bool {
        matches!(self, Entry::File(file) if file.opened)
    }
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    format!("{parent}/{name}")
}

/// All segments but the last, or `None` for the root path.
pub fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// The last segment of a path.
pub fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

/// Whether `path` equals `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/')
}

/// Number of segments after the root.
pub fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// Validate a relative path handed in by a caller.
pub fn is_valid_path(path: &str) -> bool {
    !path.is_empty() && path.split('/').all(|segment| !segment.is_empty())
}

/// Validate a single entry name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}

pub(crate) fn content_type_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("root", "a.txt"), "root/a.txt");
        assert_eq!(parent_path("root/sub/a.txt"), Some("root/sub"));
        assert_eq!(parent_path("root"), None);
        assert_eq!(file_name("root/sub/a.txt"), "a.txt");
        assert_eq!(file_name("root"), "root");
        assert_eq!(depth("root"), 0);
        assert_eq!(depth("root/sub/a.txt"), 2);
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("root/sub", "root/sub"));
        assert!(is_within("root/sub/a.txt", "root/sub"));
        assert!(!is_within("root/subway", "root/sub"));
        assert!(!is_within("root", "root/sub"));
    }

    #[test]
    fn test_validation() {
        assert!(is_valid_path("root/a.txt"));
        assert!(!is_valid_path(""));
        assert!(!is_valid_path("root//a.txt"));
        assert!(!is_valid_path("root/"));
        assert!(is_valid_name("a.txt"));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type_for("a.txt"), "text/plain");
        assert_eq!(content_type_for("Makefile"), "application/octet-stream");
    }
}
