//! Depth-bounded, concurrent enumeration of a directory subtree.
//!
//! The loader materializes a subtree into a scratch [`EntryIndex`] that the
//! caller merges into the live index in one step. Within a directory, files and
//! subdirectories are processed concurrently on the calling task; completion
//! order among siblings is unspecified and nothing here depends on it.

use crate::error::{MirrorError, Result};
use crate::mirror::entry::{join_path, DirectoryEntry, Entry, FileEntry};
use crate::mirror::filter::FilterPipeline;
use crate::mirror::tree_store::EntryIndex;
use crate::store::{DirRef, FileRef, Handle};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::io;

/// Loads subtrees through a filter pipeline.
pub struct TreeLoader<'a> {
    pipeline: &'a FilterPipeline,
}

impl<'a> TreeLoader<'a> {
    /// Create a loader that filters with `pipeline`.
    pub fn new(pipeline: &'a FilterPipeline) -> Self {
        Self { pipeline }
    }

    /// Load `dir` (found at `path`) and up to `depth` levels below it.
    ///
    /// With `depth == 1` only the immediate children are enumerated and
    /// subdirectories become unloaded placeholders. Returns `None` when the
    /// directory itself is excluded by the filter pipeline. Failing to list
    /// `dir` itself is an error; unreadable subdirectories are logged and
    /// left unloaded.
    pub async fn load(&self, dir: DirRef, path: String, depth: usize) -> Result<Option<EntryIndex>> {
        if self
            .pipeline
            .ignore(&path, &Handle::Directory(dir.clone()))
            .await
        {
            tracing::debug!("Not loading {}: excluded by filters", path);
            return Ok(None);
        }

        let children = self
            .load_children(dir.clone(), path.clone(), depth.max(1))
            .await
            .map_err(|e| MirrorError::external("enumerate", path.clone(), e))?;

        let mut index: EntryIndex = children.into_iter().collect();
        index.insert(Entry::Directory(DirectoryEntry::new(path.clone(), dir, true)));

        let swept = self.pipeline.sweep_within(&mut index, Some(&path)).await;
        if !swept.is_empty() {
            tracing::debug!("Final sweep under {} removed {} entries", path, swept.len());
        }

        tracing::debug!("Loaded {} entries under {}", index.len(), path);
        Ok(Some(index))
    }

    fn load_children<'s>(
        &'s self,
        dir: DirRef,
        path: String,
        depth: usize,
    ) -> BoxFuture<'s, io::Result<Vec<Entry>>> {
        async move {
            let mut files = Vec::new();
            let mut dirs = Vec::new();
            for handle in dir.entries().await? {
                match handle {
                    Handle::File(file) => files.push(file),
                    Handle::Directory(child) => dirs.push(child),
                }
            }

            let (files, dirs) = futures::join!(
                join_all(files.into_iter().map(|file| self.load_file(&path, file))),
                join_all(dirs.into_iter().map(|child| self.load_subdirectory(&path, child, depth))),
            );

            let mut entries: Vec<Entry> = files.into_iter().flatten().collect();
            entries.extend(dirs.into_iter().flatten());
            Ok(entries)
        }
        .boxed()
    }

    async fn load_file(&self, parent: &str, file: FileRef) -> Option<Entry> {
        let path = join_path(parent, file.name());
        if self.pipeline.ignore(&path, &Handle::File(file.clone())).await {
            return None;
        }
        match file.metadata().await {
            Ok(metadata) => Some(Entry::File(FileEntry::new(path, file, metadata))),
            Err(e) => {
                tracing::warn!("Failed to read metadata for {}: {}", path, e);
                None
            }
        }
    }

    async fn load_subdirectory(&self, parent: &str, dir: DirRef, depth: usize) -> Vec<Entry> {
        let path = join_path(parent, dir.name());
        if self
            .pipeline
            .ignore(&path, &Handle::Directory(dir.clone()))
            .await
        {
            return Vec::new();
        }

        if depth <= 1 {
            return vec![Entry::Directory(DirectoryEntry::new(path, dir, false))];
        }

        match self.load_children(dir.clone(), path.clone(), depth - 1).await {
            Ok(mut entries) => {
                entries.push(Entry::Directory(DirectoryEntry::new(path, dir, true)));
                entries
            }
            Err(e) => {
                tracing::warn!("Failed to read directory {}: {}", path, e);
                vec![Entry::Directory(DirectoryEntry::new(path, dir, false))]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mirror::filter::default_filters;
    use crate::store::MemoryStore;

    fn fixture() -> MemoryStore {
        let store = MemoryStore::new("root");
        store.write_file("a.txt", vec![b'a'; 500]);
        store.write_file("sub/b.txt", "b");
        store.write_file("sub/deep/c.txt", "c");
        store.write_file(".git/HEAD", "ref");
        store
    }

    #[tokio::test]
    async fn test_depth_one_leaves_unloaded_placeholders() {
        let store = fixture();
        let pipeline = FilterPipeline::build(&default_filters()).await;
        let index = TreeLoader::new(&pipeline)
            .load(store.root(), "root".into(), 1)
            .await
            .unwrap()
            .unwrap();

        let mut paths: Vec<_> = index.paths().cloned().collect();
        paths.sort();
        assert_eq!(paths, vec!["root", "root/a.txt", "root/sub"]);
        assert!(index.get("root").unwrap().is_loaded_dir());
        assert!(!index.get("root/sub").unwrap().is_loaded_dir());
        assert_eq!(index.get("root/a.txt").unwrap().as_file().unwrap().size, 500);
    }

    #[tokio::test]
    async fn test_deeper_load_marks_directories_loaded() {
        let store = fixture();
        let pipeline = FilterPipeline::build(&default_filters()).await;
        let index = TreeLoader::new(&pipeline)
            .load(store.root(), "root".into(), 2)
            .await
            .unwrap()
            .unwrap();

        assert!(index.get("root/sub").unwrap().is_loaded_dir());
        assert!(index.contains("root/sub/b.txt"));
        assert!(!index.get("root/sub/deep").unwrap().is_loaded_dir());
        assert!(!index.contains("root/sub/deep/c.txt"));
    }

    #[tokio::test]
    async fn test_excluded_root_loads_nothing() {
        let store = MemoryStore::new("node_modules");
        store.write_file("x.js", "x");
        let pipeline = FilterPipeline::build(&default_filters()).await;

        let loaded = TreeLoader::new(&pipeline)
            .load(store.root(), "root/node_modules".into(), 1)
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_unreadable_subdirectory_stays_unloaded() {
        let store = fixture();
        store.set_unreadable("sub", true);
        let pipeline = FilterPipeline::empty();

        let index = TreeLoader::new(&pipeline)
            .load(store.root(), "root".into(), 3)
            .await
            .unwrap()
            .unwrap();
        assert!(!index.get("root/sub").unwrap().is_loaded_dir());
        assert!(!index.contains("root/sub/b.txt"));
        // Without filters the VCS directory is mirrored too.
        assert!(index.contains("root/.git/HEAD"));
    }

    #[tokio::test]
    async fn test_unreadable_root_is_an_error() {
        let store = fixture();
        store.set_unreadable("", true);
        let pipeline = FilterPipeline::empty();

        let err = TreeLoader::new(&pipeline)
            .load(store.root(), "root".into(), 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalOperationFailed);
    }

    #[tokio::test]
    async fn test_gitignore_rules_apply_during_load() {
        let store = MemoryStore::new("root");
        store.write_file("a.log", "x");
        store.write_file("b.txt", "x");
        store.write_file("z/.gitignore", "*.log\n");
        store.write_file("z/c.log", "x");
        store.write_file(".gitignore", "*.log\n");

        let pipeline = FilterPipeline::build(&default_filters()).await;
        let index = TreeLoader::new(&pipeline)
            .load(store.root(), "root".into(), 2)
            .await
            .unwrap()
            .unwrap();

        assert!(!index.contains("root/a.log"));
        assert!(!index.contains("root/z/c.log"));
        assert!(index.contains("root/b.txt"));
        assert!(index.contains("root/.gitignore"));
    }
}
