//! Polling change detection.
//!
//! A poll cycle re-lists every watched directory, filters what it finds into a
//! virtual snapshot, classifies each surviving path against the live index
//! (the baseline) and publishes a new index only when something was added,
//! deleted or modified.

use crate::mirror::cache::CachedContent;
use crate::mirror::entry::{join_path, DirectoryEntry, Entry, FileEntry};
use crate::mirror::filter::FilterPipeline;
use crate::mirror::model::{Mirror, Shared};
use crate::mirror::tree_store::{orphaned_paths, EntryIndex};
use crate::store::{DirRef, FileRef, Handle};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tokio::time::MissedTickBehavior;

/// Entries reported for one category of change, keyed by path.
pub type EntriesCallback = Box<dyn Fn(&HashMap<String, Entry>) + Send + Sync>;

/// Modified files, keyed by path.
pub type ModifiedCallback = Box<dyn Fn(&HashMap<String, FileEntry>) + Send + Sync>;

/// Optional sinks invoked once per published cycle for each non-empty
/// category.
#[derive(Default)]
pub struct ChangeCallbacks {
    pub(crate) on_added: Option<EntriesCallback>,
    pub(crate) on_deleted: Option<EntriesCallback>,
    pub(crate) on_modified: Option<ModifiedCallback>,
}

impl ChangeCallbacks {
    fn notify(&self, changes: &ChangeSet) {
        if let Some(callback) = &self.on_added {
            if !changes.added.is_empty() {
                callback(&changes.added);
            }
        }
        if let Some(callback) = &self.on_deleted {
            if !changes.deleted.is_empty() {
                callback(&changes.deleted);
            }
        }
        if let Some(callback) = &self.on_modified {
            if !changes.modified.is_empty() {
                callback(&changes.modified);
            }
        }
    }
}

/// Differences found by one poll cycle.
///
/// The three maps are disjoint. A path whose kind changed between file and
/// directory is reported as added.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Paths new to the index, including kind changes.
    pub added: HashMap<String, Entry>,
    /// Paths gone from the index, with their last known entry.
    pub deleted: HashMap<String, Entry>,
    /// Opened files whose modification timestamp moved.
    pub modified: HashMap<String, FileEntry>,
}

impl ChangeSet {
    /// Check if the cycle found nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.modified.is_empty()
    }

    /// Total number of changed paths.
    pub fn len(&self) -> usize {
        self.added.len() + self.deleted.len() + self.modified.len()
    }
}

/// What a call to [`Mirror::poll_once`] did.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// No root is open, a mutation is in progress, or another cycle is running.
    Skipped,
    /// The walk matched the baseline; nothing was published.
    Unchanged,
    /// A new index was published with these changes.
    Published(ChangeSet),
}

enum Class {
    Added,
    Modified,
    Carried,
}

struct Classified {
    entry: Entry,
    class: Class,
    reread: Option<(String, SystemTime)>,
}

impl Mirror {
    /// Run one poll cycle now.
    pub async fn poll_once(&self) -> CycleOutcome {
        let Some(_cycle) = self.shared.gate.try_begin_cycle() else {
            tracing::trace!("Poll tick skipped");
            return CycleOutcome::Skipped;
        };

        let (root_path, root_handle, baseline, watched, fresh) = {
            let mut state = self.shared.state.write().await;
            let Some(root) = state.root.clone() else {
                return CycleOutcome::Skipped;
            };
            let baseline = Arc::clone(&state.index);
            let watched = state.watch.snapshot();
            let mut fresh: HashMap<String, CachedContent> = HashMap::new();
            for (path, entry) in baseline.iter() {
                if entry.is_opened_file() {
                    if let Some(cached) = state.cache.get_fresh(path) {
                        fresh.insert(path.clone(), cached.clone());
                    }
                }
            }
            (root.path, root.handle, baseline, watched, fresh)
        };

        let pipeline = FilterPipeline::build(&self.shared.factories).await;
        let seen = self
            .rewalk(&pipeline, &root_path, root_handle, &baseline, watched)
            .await;

        let mut added = HashMap::new();
        let mut modified = HashMap::new();
        let mut rereads = Vec::new();
        let mut index = EntryIndex::new();

        let candidates: Vec<(String, Handle)> = seen.into_iter().collect();
        for batch in candidates.chunks(self.shared.config.classify_batch_size.max(1)) {
            let results = join_all(
                batch
                    .iter()
                    .map(|(path, handle)| classify(path, handle, &baseline, &fresh)),
            )
            .await;
            for classified in results.into_iter().flatten() {
                let path = classified.entry.path().to_string();
                if let Some((content, last_modified)) = classified.reread {
                    rereads.push((path.clone(), content, last_modified));
                }
                match classified.class {
                    Class::Added => {
                        added.insert(path, classified.entry.clone());
                    }
                    Class::Modified => {
                        if let Entry::File(file) = &classified.entry {
                            modified.insert(path, file.clone());
                        }
                    }
                    Class::Carried => {}
                }
                index.insert(classified.entry);
            }
        }

        let deleted: HashMap<String, Entry> = baseline
            .iter()
            .filter(|(path, _)| !index.contains(path))
            .map(|(path, entry)| (path.clone(), entry.clone()))
            .collect();

        let changes = ChangeSet {
            added,
            deleted,
            modified,
        };

        if changes.is_empty() {
            let mut state = self.shared.state.write().await;
            for (path, content, last_modified) in rereads {
                state.cache.insert(path, content, last_modified);
            }
            tracing::trace!("Poll cycle found no changes");
            return CycleOutcome::Unchanged;
        }

        tracing::debug!(
            "Poll cycle: {} added, {} deleted, {} modified",
            changes.added.len(),
            changes.deleted.len(),
            changes.modified.len()
        );
        self.shared.callbacks.notify(&changes);
        if let Err(e) = self.shared.changes.send(changes.clone()) {
            tracing::trace!("No change subscribers: {}", e);
        }

        let mut guard = self.shared.state.write().await;
        let state = &mut *guard;
        for (path, content, last_modified) in rereads {
            state.cache.insert(path, content, last_modified);
        }
        for (path, entry) in &changes.deleted {
            state.cache.remove(path);
            if entry.is_dir() {
                state.watch.prune_under(path);
            }
        }
        state.watch.refresh(&index);
        state.index = Arc::new(index);
        state.filters = Some(Arc::new(pipeline));
        self.publish(state);

        CycleOutcome::Published(changes)
    }

    /// List every watched directory and collect the filtered survivors.
    async fn rewalk(
        &self,
        pipeline: &FilterPipeline,
        root_path: &str,
        root_handle: DirRef,
        baseline: &EntryIndex,
        watched: Vec<(String, DirRef)>,
    ) -> HashMap<String, Handle> {
        let max_entries = self.shared.config.max_directory_entries;
        let listings = join_all(watched.into_iter().map(|(path, dir)| async move {
            let listing = match dir.entries().await {
                Ok(children) if children.len() > max_entries => {
                    tracing::debug!(
                        "Skipping {} this cycle: {} entries exceed the limit of {}",
                        path,
                        children.len(),
                        max_entries
                    );
                    None
                }
                Ok(children) => Some(children),
                Err(e) => {
                    tracing::warn!("Failed to list {}: {}", path, e);
                    None
                }
            };
            (path, listing)
        }))
        .await;

        let mut seen: HashMap<String, Handle> = HashMap::new();
        seen.insert(root_path.to_string(), Handle::Directory(root_handle));

        for (dir_path, listing) in listings {
            match listing {
                Some(children) => {
                    for handle in children {
                        let path = join_path(&dir_path, handle.name());
                        if !pipeline.ignore(&path, &handle).await {
                            seen.insert(path, handle);
                        }
                    }
                }
                None => {
                    for child in baseline.children(&dir_path) {
                        seen.insert(child.path().to_string(), child.handle());
                    }
                }
            }
        }

        // Rules discovered late in the walk apply to everything.
        let mut excluded = Vec::new();
        for (path, handle) in &seen {
            if pipeline.ignore(path, handle).await {
                excluded.push(path.clone());
            }
        }
        for path in excluded {
            seen.remove(&path);
        }

        let detached = orphaned_paths(seen.iter().map(|(path, handle)| (path, handle.is_dir())));
        for path in detached {
            seen.remove(&path);
        }
        seen
    }

    /// Poll every `poll_interval` until [`stop_watching`](Self::stop_watching).
    ///
    /// Each tick spawns its own cycle; ticks that land while a cycle or a
    /// mutation is running do nothing.
    pub fn start_watching(&self) {
        let mut ticker = self.shared.ticker.lock();
        if ticker.is_some() {
            return;
        }

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let period = self.shared.config.poll_interval;
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let mirror = Mirror { shared };
                tokio::spawn(async move {
                    mirror.poll_once().await;
                });
            }
        }));
        tracing::debug!("Started watching every {:?}", period);
    }

    /// Stop scheduling poll cycles and drop the session filter state.
    ///
    /// A cycle that is already running finishes normally.
    pub async fn stop_watching(&self) {
        let ticker = self.shared.ticker.lock().take();
        if let Some(ticker) = ticker {
            ticker.abort();
            tracing::debug!("Stopped watching");
        }
        self.shared.state.write().await.filters = None;
    }

    /// Check if the ticker is running.
    pub fn is_watching(&self) -> bool {
        self.shared.ticker.lock().is_some()
    }
}

/// Classify one surviving path against the baseline.
///
/// Returns `None` for a file whose metadata can no longer be read, which the
/// caller then treats as absent.
async fn classify(
    path: &str,
    handle: &Handle,
    baseline: &EntryIndex,
    fresh: &HashMap<String, CachedContent>,
) -> Option<Classified> {
    match (handle, baseline.get(path)) {
        (Handle::Directory(dir), Some(Entry::Directory(previous))) => Some(Classified {
            entry: Entry::Directory(DirectoryEntry::new(
                path.to_string(),
                dir.clone(),
                previous.loaded,
            )),
            class: Class::Carried,
            reread: None,
        }),
        (Handle::Directory(dir), _) => Some(Classified {
            entry: Entry::Directory(DirectoryEntry::new(path.to_string(), dir.clone(), false)),
            class: Class::Added,
            reread: None,
        }),
        (Handle::File(file), Some(Entry::File(previous))) => {
            refresh_file(path, file, previous, fresh.get(path)).await
        }
        (Handle::File(file), _) => match file.metadata().await {
            Ok(metadata) => Some(Classified {
                entry: Entry::File(FileEntry::new(path.to_string(), file.clone(), metadata)),
                class: Class::Added,
                reread: None,
            }),
            Err(e) => {
                tracing::warn!("Failed to read metadata for {}: {}", path, e);
                None
            }
        },
    }
}

async fn refresh_file(
    path: &str,
    file: &FileRef,
    previous: &FileEntry,
    cached: Option<&CachedContent>,
) -> Option<Classified> {
    let metadata = match file.metadata().await {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::warn!("Failed to read metadata for {}: {}", path, e);
            return None;
        }
    };

    let mut entry = previous.clone();
    entry.handle = file.clone();
    entry.apply_metadata(metadata);
    if !previous.opened {
        return Some(Classified {
            entry: Entry::File(entry),
            class: Class::Carried,
            reread: None,
        });
    }

    let timestamp_changed = metadata.last_modified != previous.last_modified;
    let reusable = cached
        .filter(|cached| cached.last_modified == metadata.last_modified)
        .map(|cached| cached.content.clone());

    let mut reread = None;
    match reusable {
        Some(content) => entry.open_with(content),
        None => match file.read().await {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes).into_owned();
                entry.open_with(content.clone());
                reread = Some((content, metadata.last_modified));
            }
            Err(e) => tracing::warn!("Failed to re-read {}: {}", path, e),
        },
    }

    Some(Classified {
        entry: Entry::File(entry),
        class: if timestamp_changed {
            Class::Modified
        } else {
            Class::Carried
        },
        reread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AccessMode, MemoryStore};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn fixture() -> MemoryStore {
        let store = MemoryStore::new("root");
        store.write_file("a.txt", vec![b'a'; 500]);
        store.write_file("sub/b.txt", "b");
        store
    }

    type Seen = Arc<Mutex<Vec<(&'static str, Vec<String>)>>>;

    fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
        let mut keys: Vec<String> = map.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn recording_mirror(seen: &Seen) -> Mirror {
        let added = Arc::clone(seen);
        let deleted = Arc::clone(seen);
        let modified = Arc::clone(seen);
        Mirror::builder()
            .on_added(Box::new(move |entries| {
                added.lock().push(("added", sorted_keys(entries)));
            }))
            .on_deleted(Box::new(move |entries| {
                deleted.lock().push(("deleted", sorted_keys(entries)));
            }))
            .on_modified(Box::new(move |files| {
                modified.lock().push(("modified", sorted_keys(files)));
            }))
            .build()
    }

    #[tokio::test]
    async fn test_modified_opened_file() {
        let store = fixture();
        let seen: Seen = Arc::default();
        let mirror = recording_mirror(&seen);
        mirror.open_root(store.root(), AccessMode::Read).await.unwrap();
        mirror.open_file("root/a.txt").await.unwrap();

        store.write_file("a.txt", vec![b'b'; 600]);
        let outcome = mirror.poll_once().await;

        let CycleOutcome::Published(changes) = outcome else {
            panic!("expected a published cycle, got {outcome:?}");
        };
        assert!(changes.added.is_empty());
        assert!(changes.deleted.is_empty());
        assert_eq!(changes.modified.len(), 1);
        assert_eq!(changes.modified["root/a.txt"].size, 600);

        assert_eq!(
            *seen.lock(),
            vec![("modified", vec!["root/a.txt".to_string()])]
        );
        let entry = mirror.entry("root/a.txt").await.unwrap();
        assert_eq!(entry.as_file().unwrap().content.as_deref(), Some("b".repeat(600).as_str()));
    }

    #[tokio::test]
    async fn test_unchanged_tree_publishes_nothing() {
        let store = fixture();
        let mirror = Mirror::new();
        mirror.open_root(store.root(), AccessMode::Read).await.unwrap();
        let before = mirror.index().await;

        assert!(matches!(mirror.poll_once().await, CycleOutcome::Unchanged));
        assert!(Arc::ptr_eq(&before, &mirror.index().await));
    }

    #[tokio::test]
    async fn test_added_and_deleted_are_disjoint_and_complete() {
        let store = fixture();
        store.write_file("gone.txt", "x");
        let mirror = Mirror::new();
        mirror.open_root(store.root(), AccessMode::Read).await.unwrap();
        let baseline = mirror.index().await;

        store.remove("gone.txt");
        store.write_file("new.txt", "n");
        store.create_dir("fresh");

        let CycleOutcome::Published(changes) = mirror.poll_once().await else {
            panic!("expected a published cycle");
        };
        let current = mirror.index().await;

        for path in current.paths() {
            if !baseline.contains(path) {
                assert!(changes.added.contains_key(path), "{path} missing from added");
            }
        }
        for path in baseline.paths() {
            if !current.contains(path) {
                assert!(changes.deleted.contains_key(path), "{path} missing from deleted");
            }
        }
        for path in changes.added.keys() {
            assert!(!changes.deleted.contains_key(path));
            assert!(!changes.modified.contains_key(path));
        }

        let mut added: Vec<_> = changes.added.keys().cloned().collect();
        added.sort();
        assert_eq!(added, vec!["root/fresh", "root/new.txt"]);
        assert!(!current.get("root/fresh").unwrap().is_loaded_dir());
        assert_eq!(changes.deleted.keys().collect::<Vec<_>>(), vec!["root/gone.txt"]);
    }

    #[tokio::test]
    async fn test_deleted_directory_prunes_watch_index() {
        let store = fixture();
        store.write_file("sub/inner/c.txt", "c");
        let mirror = Mirror::builder().load_depth(3).build();
        mirror.open_root(store.root(), AccessMode::Read).await.unwrap();
        assert!(mirror.is_watched("root/sub/inner").await);

        store.remove("sub");
        let CycleOutcome::Published(changes) = mirror.poll_once().await else {
            panic!("expected a published cycle");
        };

        let mut deleted: Vec<_> = changes.deleted.keys().cloned().collect();
        deleted.sort();
        assert_eq!(
            deleted,
            vec!["root/sub", "root/sub/b.txt", "root/sub/inner", "root/sub/inner/c.txt"]
        );
        assert!(!mirror.is_watched("root/sub").await);
        assert!(!mirror.is_watched("root/sub/inner").await);
        assert!(mirror.is_watched("root").await);
    }

    #[tokio::test]
    async fn test_loaded_flag_survives_cycles() {
        let store = fixture();
        let mirror = Mirror::new();
        mirror.open_root(store.root(), AccessMode::Read).await.unwrap();
        mirror.expand_directory("root/sub").await.unwrap();

        store.write_file("sub/new.txt", "n");
        assert!(matches!(mirror.poll_once().await, CycleOutcome::Published(_)));
        assert!(mirror.entry("root/sub").await.unwrap().is_loaded_dir());
        assert!(mirror.entry("root/sub/new.txt").await.is_some());
    }

    #[tokio::test]
    async fn test_cached_content_is_reused_until_timestamp_moves() {
        let store = fixture();
        let mirror = Mirror::new();
        mirror.open_root(store.root(), AccessMode::Read).await.unwrap();
        mirror.open_file("root/a.txt").await.unwrap();
        let reads = store.read_count();

        mirror.poll_once().await;
        assert_eq!(store.read_count(), reads);

        store.write_file("a.txt", "changed");
        mirror.poll_once().await;
        assert_eq!(store.read_count(), reads + 1);
    }

    #[tokio::test]
    async fn test_expired_cache_forces_reread() {
        let store = fixture();
        let mirror = Mirror::builder().cache_ttl(Duration::ZERO).build();
        mirror.open_root(store.root(), AccessMode::Read).await.unwrap();
        mirror.open_file("root/a.txt").await.unwrap();
        let reads = store.read_count();
        std::thread::sleep(Duration::from_millis(2));

        assert!(matches!(mirror.poll_once().await, CycleOutcome::Unchanged));
        assert_eq!(store.read_count(), reads + 1);
        assert!(mirror.is_cached("root/a.txt").await);
    }

    #[tokio::test]
    async fn test_unreadable_directory_keeps_its_children() {
        let store = fixture();
        let mirror = Mirror::new();
        mirror.open_root(store.root(), AccessMode::Read).await.unwrap();
        mirror.expand_directory("root/sub").await.unwrap();

        store.set_unreadable("sub", true);
        store.write_file("sub/hidden.txt", "h");
        assert!(matches!(mirror.poll_once().await, CycleOutcome::Unchanged));
        assert!(mirror.entry("root/sub/b.txt").await.is_some());
    }

    #[tokio::test]
    async fn test_oversized_directory_is_skipped() {
        let store = fixture();
        let mirror = Mirror::builder().max_directory_entries(2).build();
        mirror.open_root(store.root(), AccessMode::Read).await.unwrap();

        store.write_file("c.txt", "c");
        assert!(matches!(mirror.poll_once().await, CycleOutcome::Unchanged));
        assert!(mirror.entry("root/c.txt").await.is_none());
    }

    #[tokio::test]
    async fn test_late_gitignore_applies_to_earlier_siblings() {
        let store = fixture();
        let mirror = Mirror::new();
        mirror.open_root(store.root(), AccessMode::Read).await.unwrap();

        // Listed before the rules file, so only the final sweep catches it.
        store.write_file("-debug.log", "x");
        store.write_file(".gitignore", "*.log\n");
        let CycleOutcome::Published(changes) = mirror.poll_once().await else {
            panic!("expected a published cycle");
        };
        assert!(!changes.added.contains_key("root/-debug.log"));
        assert!(changes.added.contains_key("root/.gitignore"));
        assert!(mirror.entry("root/-debug.log").await.is_none());

        // Filtering the published snapshot again removes nothing.
        let pipeline = mirror.current_pipeline().await;
        let mut index = (*mirror.index().await).clone();
        assert!(pipeline.sweep(&mut index).await.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_skipped_while_paused() {
        let store = fixture();
        let mirror = Mirror::new();
        mirror.open_root(store.root(), AccessMode::Read).await.unwrap();

        let pause = mirror.shared.gate.pause().await;
        assert!(matches!(mirror.poll_once().await, CycleOutcome::Skipped));
        drop(pause);
        assert!(matches!(mirror.poll_once().await, CycleOutcome::Unchanged));
    }

    #[tokio::test]
    async fn test_changes_are_broadcast() {
        let store = fixture();
        let mirror = Mirror::new();
        let mut rx = mirror.subscribe_changes();
        mirror.open_root(store.root(), AccessMode::Read).await.unwrap();

        store.write_file("new.txt", "n");
        mirror.poll_once().await;
        let changes = rx.try_recv().unwrap();
        assert!(changes.added.contains_key("root/new.txt"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watching_polls_on_interval() {
        let store = fixture();
        let mirror = Mirror::builder()
            .poll_interval(Duration::from_millis(500))
            .build();
        let mut rx = mirror.subscribe_changes();
        mirror.open_root(store.root(), AccessMode::Read).await.unwrap();

        mirror.start_watching();
        assert!(mirror.is_watching());
        store.write_file("new.txt", "n");

        let changes = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(changes.added.contains_key("root/new.txt"));

        mirror.stop_watching().await;
        assert!(!mirror.is_watching());
        store.write_file("later.txt", "l");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(mirror.entry("root/later.txt").await.is_none());
    }
}
