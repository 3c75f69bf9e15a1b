//! Path-keyed entry index and the watch index of loaded directories.
//!
//! `EntryIndex` is the flat mirror of the known tree. It is shared as
//! `Arc<EntryIndex>` so a finished snapshot can be published by swapping the
//! pointer; edits go through `Arc::make_mut`, which clones only while an older
//! snapshot is still held elsewhere.

use crate::mirror::entry::{depth, is_within, parent_path, Entry};
use crate::store::DirRef;
use std::collections::{HashMap, HashSet};

/// Mapping from path to entry.
#[derive(Debug, Clone, Default)]
pub struct EntryIndex {
    entries: HashMap<String, Entry>,
}

impl EntryIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Get the entry at `path`.
    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    /// Get mutable access to the entry at `path`.
    pub fn get_mut(&mut self, path: &str) -> Option<&mut Entry> {
        self.entries.get_mut(path)
    }

    /// Check if `path` has an entry.
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Insert or replace the entry stored under its own path.
    pub fn insert(&mut self, entry: Entry) -> Option<Entry> {
        self.entries.insert(entry.path().to_string(), entry)
    }

    /// Remove the entry at `path` only, leaving descendants in place.
    pub fn remove(&mut self, path: &str) -> Option<Entry> {
        self.entries.remove(path)
    }

    /// Iterate over `(path, entry)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }

    /// Iterate over every path.
    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Immediate children of a directory path.
    pub fn children(&self, parent: &str) -> Vec<&Entry> {
        self.entries
            .iter()
            .filter(|(path, _)| parent_path(path) == Some(parent))
            .map(|(_, entry)| entry)
            .collect()
    }

    /// Every path strictly below `path`, deepest first.
    pub fn descendants(&self, path: &str) -> Vec<String> {
        let mut found: Vec<String> = self
            .entries
            .keys()
            .filter(|candidate| candidate.as_str() != path && is_within(candidate, path))
            .cloned()
            .collect();
        found.sort_unstable_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));
        found
    }

    /// Remove `path` and everything below it, returning what was removed.
    pub fn remove_subtree(&mut self, path: &str) -> Vec<Entry> {
        let mut removed: Vec<Entry> = self
            .descendants(path)
            .into_iter()
            .filter_map(|descendant| self.entries.remove(&descendant))
            .collect();
        if let Some(entry) = self.entries.remove(path) {
            removed.push(entry);
        }
        removed
    }

    /// Merge another index into this one, replacing entries on collision.
    pub fn extend(&mut self, other: EntryIndex) {
        self.entries.extend(other.entries);
    }

    /// Get a summary of the index for debugging.
    pub fn debug_summary(&self) -> String {
        let dirs = self.entries.values().filter(|e| e.is_dir()).count();
        let opened = self.entries.values().filter(|e| e.is_opened_file()).count();
        format!(
            "EntryIndex: {} entries ({} directories, {} opened files)",
            self.entries.len(),
            dirs,
            opened
        )
    }
}

impl IntoIterator for EntryIndex {
    type Item = Entry;
    type IntoIter = std::collections::hash_map::IntoValues<String, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}

impl FromIterator<Entry> for EntryIndex {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        let mut index = EntryIndex::new();
        for entry in iter {
            index.insert(entry);
        }
        index
    }
}

/// Paths whose parent is missing or not a directory, directly or
/// transitively. Items are `(path, is_dir)`.
///
/// Paths are visited shallowest first so a missing directory takes its whole
/// subtree with it.
pub(crate) fn orphaned_paths<'a, I>(paths: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a String, bool)>,
{
    let mut sorted: Vec<(&String, bool)> = paths.into_iter().collect();
    sorted.sort_unstable_by_key(|(path, _)| depth(path));

    let mut kept_dirs: HashSet<&str> = HashSet::new();
    let mut orphans = Vec::new();
    for (path, is_dir) in sorted {
        if parent_path(path).is_some_and(|parent| !kept_dirs.contains(parent)) {
            orphans.push(path.clone());
        } else if is_dir {
            kept_dirs.insert(path.as_str());
        }
    }
    orphans
}

/// Directory handles of every loaded directory, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct WatchIndex {
    dirs: HashMap<String, DirRef>,
}

impl WatchIndex {
    /// Create an empty watch index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of watched directories.
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    /// Check if nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Stop watching everything.
    pub fn clear(&mut self) {
        self.dirs.clear();
    }

    /// Watch the directory at `path`.
    pub fn insert(&mut self, path: String, handle: DirRef) {
        self.dirs.insert(path, handle);
    }

    /// Stop watching `path` only.
    pub fn remove(&mut self, path: &str) -> Option<DirRef> {
        self.dirs.remove(path)
    }

    /// Check if `path` is watched.
    pub fn contains(&self, path: &str) -> bool {
        self.dirs.contains_key(path)
    }

    /// Remove `path` and every watched directory below it.
    pub fn prune_under(&mut self, path: &str) {
        self.dirs.retain(|watched, _| !is_within(watched, path));
    }

    /// Keep only paths that are still loaded directories in `index`, picking
    /// up their current handles.
    pub fn refresh(&mut self, index: &EntryIndex) {
        self.dirs.retain(|path, handle| {
            match index.get(path).and_then(Entry::as_directory) {
                Some(dir) if dir.loaded => {
                    *handle = dir.handle.clone();
                    true
                }
                _ => false,
            }
        });
    }

    /// Copy of every watched `(path, handle)` pair.
    pub fn snapshot(&self) -> Vec<(String, DirRef)> {
        self.dirs
            .iter()
            .map(|(path, handle)| (path.clone(), handle.clone()))
            .collect()
    }

    /// Re-register every loaded directory of `index` below `path`.
    pub fn register_loaded(&mut self, index: &EntryIndex, path: &str) {
        for (candidate, entry) in index.iter() {
            if let Some(dir) = entry.as_directory() {
                if dir.loaded && is_within(candidate, path) {
                    self.dirs.insert(candidate.clone(), dir.handle.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::entry::DirectoryEntry;
    use crate::store::MemoryStore;

    fn dir(store: &MemoryStore, path: &str, loaded: bool) -> Entry {
        Entry::Directory(DirectoryEntry::new(path.to_string(), store.root(), loaded))
    }

    #[test]
    fn test_insert_get_remove() {
        let store = MemoryStore::new("root");
        let mut index = EntryIndex::new();
        index.insert(dir(&store, "root", true));
        index.insert(dir(&store, "root/sub", false));

        assert_eq!(index.len(), 2);
        assert!(index.get("root/sub").is_some());

        index.remove("root/sub");
        assert!(!index.contains("root/sub"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_insert_same_path_replaces() {
        let store = MemoryStore::new("root");
        let mut index = EntryIndex::new();
        index.insert(dir(&store, "root/sub", false));
        index.insert(dir(&store, "root/sub", true));

        assert_eq!(index.len(), 1);
        assert!(index.get("root/sub").unwrap().is_loaded_dir());
    }

    #[test]
    fn test_remove_subtree_removes_children() {
        let store = MemoryStore::new("root");
        let mut index: EntryIndex = [
            dir(&store, "root", true),
            dir(&store, "root/sub", true),
            dir(&store, "root/sub/inner", true),
            dir(&store, "root/subway", false),
        ]
        .into_iter()
        .collect();

        let removed = index.remove_subtree("root/sub");
        assert_eq!(removed.len(), 2);
        assert!(index.contains("root/subway"));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_descendants_deepest_first() {
        let store = MemoryStore::new("root");
        let index: EntryIndex = [
            dir(&store, "root", true),
            dir(&store, "root/a", true),
            dir(&store, "root/a/b", true),
            dir(&store, "root/a/b/c", false),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            index.descendants("root/a"),
            vec!["root/a/b/c".to_string(), "root/a/b".to_string()]
        );
    }

    #[test]
    fn test_orphaned_paths_cascade() {
        let paths: Vec<(String, bool)> = vec![
            ("root".into(), true),
            ("root/gone/a".into(), true),
            ("root/gone/a/b".into(), false),
            ("root/kept".into(), true),
            ("root/file.txt".into(), false),
            ("root/file.txt/child".into(), false),
        ];

        let mut removed = orphaned_paths(paths.iter().map(|(path, is_dir)| (path, *is_dir)));
        removed.sort();
        assert_eq!(
            removed,
            vec![
                "root/file.txt/child".to_string(),
                "root/gone/a".to_string(),
                "root/gone/a/b".to_string(),
            ]
        );
    }

    #[test]
    fn test_watch_index_prune_under() {
        let store = MemoryStore::new("root");
        let mut watch = WatchIndex::new();
        watch.insert("root".into(), store.root());
        watch.insert("root/sub".into(), store.root());
        watch.insert("root/sub/inner".into(), store.root());
        watch.insert("root/subway".into(), store.root());

        watch.prune_under("root/sub");
        assert!(watch.contains("root"));
        assert!(watch.contains("root/subway"));
        assert_eq!(watch.len(), 2);
    }
}
