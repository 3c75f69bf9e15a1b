//! Store adapter over a directory on the local filesystem.

use super::{
    AccessMode, DirRef, DirectoryHandle, FileHandle, FileMetadata, FileRef, Handle,
    PermissionState, WritableFile,
};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// Entry point for mirroring a local directory.
pub struct LocalStore;

impl LocalStore {
    /// Hand out a root handle for `path`, which must be an existing directory.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<DirRef> {
        let path = fs::canonicalize(path.as_ref()).await?;
        if !fs::metadata(&path).await?.is_dir() {
            return Err(io::Error::other(format!("{} is not a directory", path.display())));
        }
        Ok(Arc::new(LocalDirectory::new(path)))
    }
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[derive(Debug)]
struct LocalDirectory {
    name: String,
    path: PathBuf,
}

impl LocalDirectory {
    fn new(path: PathBuf) -> Self {
        Self {
            name: name_of(&path),
            path,
        }
    }
}

#[async_trait]
impl DirectoryHandle for LocalDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn entries(&self) -> io::Result<Vec<Handle>> {
        let mut handles = Vec::new();
        let mut read_dir = fs::read_dir(&self.path).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            if file_type.is_dir() {
                handles.push(Handle::Directory(Arc::new(LocalDirectory::new(entry.path()))));
            } else if file_type.is_file() {
                handles.push(Handle::File(Arc::new(LocalFile::new(entry.path()))));
            }
        }
        Ok(handles)
    }

    async fn file(&self, name: &str, create: bool) -> io::Result<FileRef> {
        let path = self.path.join(name);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(io::Error::other(format!("{name} is a directory"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound && create => {
                fs::write(&path, b"").await?;
            }
            Err(e) => return Err(e),
        }
        Ok(Arc::new(LocalFile::new(path)))
    }

    async fn directory(&self, name: &str, create: bool) -> io::Result<DirRef> {
        let path = self.path.join(name);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(io::Error::other(format!("{name} is a file"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound && create => {
                fs::create_dir(&path).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(Arc::new(LocalDirectory::new(path)))
    }

    async fn remove_entry(&self, name: &str, recursive: bool) -> io::Result<()> {
        let path = self.path.join(name);
        let meta = fs::metadata(&path).await?;
        if !meta.is_dir() {
            fs::remove_file(&path).await
        } else if recursive {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_dir(&path).await
        }
    }

    async fn query_permission(&self, mode: AccessMode) -> PermissionState {
        match fs::metadata(&self.path).await {
            Ok(meta) if mode == AccessMode::ReadWrite && meta.permissions().readonly() => {
                PermissionState::Denied
            }
            Ok(_) => PermissionState::Granted,
            Err(_) => PermissionState::Denied,
        }
    }
}

#[derive(Debug)]
struct LocalFile {
    name: String,
    path: PathBuf,
}

impl LocalFile {
    fn new(path: PathBuf) -> Self {
        Self {
            name: name_of(&path),
            path,
        }
    }
}

#[async_trait]
impl FileHandle for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn metadata(&self) -> io::Result<FileMetadata> {
        let meta = fs::metadata(&self.path).await?;
        Ok(FileMetadata {
            size: meta.len(),
            last_modified: meta.modified()?,
        })
    }

    async fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path).await
    }

    async fn create_writable(&self) -> io::Result<Box<dyn WritableFile>> {
        Ok(Box::new(LocalWritable {
            path: self.path.clone(),
            buffer: Vec::new(),
        }))
    }
}

/// Buffers writes and commits them in one `fs::write` on close.
struct LocalWritable {
    path: PathBuf,
    buffer: Vec<u8>,
}

#[async_trait]
impl WritableFile for LocalWritable {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        fs::write(&self.path, std::mem::take(&mut self.buffer)).await
    }

    async fn abort(&mut self) -> io::Result<()> {
        self.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::{Mirror, WriteOptions};
    use crate::store::AccessMode;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_enumerate_and_read() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("a.txt"), "hello").unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();

        let root = LocalStore::open(temp.path()).await.unwrap();
        let mut names: Vec<_> = root
            .entries()
            .await
            .unwrap()
            .iter()
            .map(|h| (h.name().to_string(), h.is_dir()))
            .collect();
        names.sort();
        assert_eq!(names, vec![("a.txt".to_string(), false), ("sub".to_string(), true)]);

        let file = root.file("a.txt", false).await.unwrap();
        assert_eq!(file.read().await.unwrap(), b"hello");
        assert_eq!(file.metadata().await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn test_write_commits_on_close() {
        let temp = tempdir().unwrap();
        let root = LocalStore::open(temp.path()).await.unwrap();

        let file = root.file("new.txt", true).await.unwrap();
        let mut stream = file.create_writable().await.unwrap();
        stream.write(b"data").await.unwrap();
        assert_eq!(std::fs::read(temp.path().join("new.txt")).unwrap(), b"");
        stream.close().await.unwrap();
        assert_eq!(std::fs::read(temp.path().join("new.txt")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_remove_directory() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("sub/inner")).unwrap();
        let root = LocalStore::open(temp.path()).await.unwrap();

        assert!(root.remove_entry("sub", false).await.is_err());
        root.remove_entry("sub", true).await.unwrap();
        assert!(!temp.path().join("sub").exists());
    }

    #[tokio::test]
    async fn test_mirror_over_local_directory() {
        let temp = tempdir().unwrap();
        let project = temp.path().join("project");
        std::fs::create_dir_all(project.join("target/debug")).unwrap();
        std::fs::write(project.join("a.txt"), "hello").unwrap();

        let root = LocalStore::open(&project).await.unwrap();
        let mirror = Mirror::new();
        mirror.open_root(root, AccessMode::ReadWrite).await.unwrap();
        assert!(mirror.entry("project/a.txt").await.is_some());
        assert!(mirror.entry("project/target").await.is_none());

        let written = mirror
            .write_file("project/b.txt", WriteOptions::create(), Some(b"abc"))
            .await
            .unwrap();
        assert_eq!(written.size, 3);
        assert_eq!(std::fs::read(project.join("b.txt")).unwrap(), b"abc");
    }
}
