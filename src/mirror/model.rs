//! The mirror engine object.
//!
//! `Mirror` owns every piece of shared state (live index, watch index, content
//! cache, session filters) behind one `RwLock`, plus the engine gate that keeps
//! poll cycles and mutations apart. It is cheap to clone; clones share state.

use crate::error::{MirrorError, Result};
use crate::mirror::cache::ContentCache;
use crate::mirror::entry::{is_valid_path, parent_path, DirectoryEntry, Entry, FileEntry};
use crate::mirror::filter::{default_filters, FilterFactory, FilterPipeline};
use crate::mirror::gate::{EngineGate, EngineState};
use crate::mirror::loader::TreeLoader;
use crate::mirror::publish::IndexPublisher;
use crate::mirror::tree_store::{EntryIndex, WatchIndex};
use crate::mirror::watcher::{ChangeCallbacks, ChangeSet, EntriesCallback, ModifiedCallback};
use crate::persist::RootStore;
use crate::store::{AccessMode, DirRef, PermissionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;

/// Tunables for a [`Mirror`].
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Levels materialized by `open_root` and `expand_directory`.
    pub load_depth: usize,
    /// Time between poll cycles once watching has started.
    pub poll_interval: Duration,
    /// Age after which cached content of an opened file is re-read.
    pub cache_ttl: Duration,
    /// Opened files whose content is cached before LRU eviction.
    pub max_cached_files: usize,
    /// Directories with more children than this are skipped by a poll cycle.
    pub max_directory_entries: usize,
    /// Number of paths classified concurrently during a poll cycle.
    pub classify_batch_size: usize,
    /// Debounce window of the published index.
    pub publish_delay: Duration,
    /// Capacity of the change set broadcast channel.
    pub change_buffer: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            load_depth: 1,
            poll_interval: Duration::from_millis(1000),
            cache_ttl: Duration::from_secs(30),
            max_cached_files: 1024,
            max_directory_entries: 10_000,
            classify_batch_size: 32,
            publish_delay: Duration::from_millis(100),
            change_buffer: 256,
        }
    }
}

/// The open root and the access mode it was granted with.
#[derive(Debug, Clone)]
pub(crate) struct RootInfo {
    pub path: String,
    pub handle: DirRef,
    pub mode: AccessMode,
}

#[derive(Debug)]
pub(crate) struct MirrorState {
    pub root: Option<RootInfo>,
    pub index: Arc<EntryIndex>,
    pub watch: WatchIndex,
    pub cache: ContentCache,
    /// Filter pipeline of the current open/poll session.
    pub filters: Option<Arc<FilterPipeline>>,
}

impl MirrorState {
    fn empty(config: &MirrorConfig) -> Self {
        Self {
            root: None,
            index: Arc::new(EntryIndex::new()),
            watch: WatchIndex::new(),
            cache: ContentCache::new(config.max_cached_files, config.cache_ttl),
            filters: None,
        }
    }
}

pub(crate) struct Shared {
    pub config: MirrorConfig,
    pub state: RwLock<MirrorState>,
    pub gate: Arc<EngineGate>,
    pub factories: Vec<Arc<dyn FilterFactory>>,
    pub callbacks: ChangeCallbacks,
    pub changes: broadcast::Sender<ChangeSet>,
    pub publisher: IndexPublisher,
    pub root_store: Option<Arc<dyn RootStore>>,
    pub ticker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            ticker.abort();
        }
    }
}

/// Incremental mirror of one permission-scoped directory tree.
///
/// Must be built inside a tokio runtime.
#[derive(Clone)]
pub struct Mirror {
    pub(crate) shared: Arc<Shared>,
}

impl Mirror {
    /// A mirror with default configuration and filters.
    pub fn new() -> Self {
        MirrorBuilder::new().build()
    }

    /// Start configuring a mirror.
    pub fn builder() -> MirrorBuilder {
        MirrorBuilder::new()
    }

    /// Get the configuration the mirror was built with.
    pub fn config(&self) -> &MirrorConfig {
        &self.shared.config
    }

    /// Whether a poll cycle or a mutation is currently running.
    pub fn engine_state(&self) -> EngineState {
        self.shared.gate.state()
    }

    /// Open `handle` as the new root, discarding all state of the previous one.
    ///
    /// The root is loaded `load_depth` levels deep. Fails with
    /// `PermissionDenied` if `mode` is not granted and with `InvalidArgument`
    /// if the default filters exclude the root itself.
    pub async fn open_root(&self, handle: DirRef, mode: AccessMode) -> Result<Entry> {
        let path = handle.name().to_string();
        if !is_valid_path(&path) || path.contains('/') {
            return Err(MirrorError::invalid(path, "root name must be a single non-empty segment"));
        }

        let permission = handle.query_permission(mode).await;
        if permission != PermissionState::Granted {
            tracing::warn!("Access {:?} to {} is {:?}", mode, path, permission);
            return Err(MirrorError::PermissionDenied(path));
        }

        let _pause = self.shared.gate.pause().await;
        let pipeline = Arc::new(FilterPipeline::build(&self.shared.factories).await);
        let index = TreeLoader::new(&pipeline)
            .load(handle.clone(), path.clone(), self.shared.config.load_depth)
            .await?
            .ok_or_else(|| MirrorError::invalid(path.clone(), "root is excluded by filters"))?;

        let mut watch = WatchIndex::new();
        watch.register_loaded(&index, &path);

        if let Some(root_store) = &self.shared.root_store {
            if let Err(e) = root_store.save(&path, handle.clone()).await {
                tracing::warn!("Failed to remember root {}: {}", path, e);
            }
        }

        let root = index
            .get(&path)
            .cloned()
            .ok_or_else(|| MirrorError::NotFound(path.clone()))?;

        let mut state = self.shared.state.write().await;
        *state = MirrorState {
            root: Some(RootInfo {
                path: path.clone(),
                handle,
                mode,
            }),
            index: Arc::new(index),
            watch,
            cache: ContentCache::new(self.shared.config.max_cached_files, self.shared.config.cache_ttl),
            filters: Some(pipeline),
        };
        tracing::debug!("Opened root {}: {}", path, state.index.debug_summary());
        self.publish(&state);
        Ok(root)
    }

    /// Forget the open root and everything mirrored from it.
    pub async fn close_root(&self) {
        let _pause = self.shared.gate.pause().await;
        let mut state = self.shared.state.write().await;
        if let Some(root) = state.root.take() {
            tracing::debug!("Closed root {}", root.path);
        }
        *state = MirrorState::empty(&self.shared.config);
        self.publish(&state);
    }

    /// Path of the open root, if any.
    pub async fn root_path(&self) -> Option<String> {
        self.shared
            .state
            .read()
            .await
            .root
            .as_ref()
            .map(|root| root.path.clone())
    }

    /// Materialize an unloaded directory. No-op if it is already loaded.
    pub async fn expand_directory(&self, path: &str) -> Result<DirectoryEntry> {
        validate_path(path)?;
        let _pause = self.shared.gate.pause().await;

        let handle = {
            let state = self.shared.state.read().await;
            root_info(&state)?;
            let dir = lookup(&state.index, path)?
                .as_directory()
                .ok_or_else(|| MirrorError::NotADirectory(path.to_string()))?;
            if dir.loaded {
                return Ok(dir.clone());
            }
            dir.handle.clone()
        };

        let pipeline = self.current_pipeline().await;
        let loaded = TreeLoader::new(&pipeline)
            .load(handle, path.to_string(), self.shared.config.load_depth)
            .await?
            .ok_or_else(|| MirrorError::invalid(path, "directory is excluded by filters"))?;

        let mut guard = self.shared.state.write().await;
        let state = &mut *guard;
        if !state.index.contains(path) {
            return Err(MirrorError::NotFound(path.to_string()));
        }

        let index = Arc::make_mut(&mut state.index);
        state.watch.register_loaded(&loaded, path);
        for entry in loaded {
            // Opened files keep their content.
            if !index.get(entry.path()).is_some_and(Entry::is_opened_file) {
                index.insert(entry);
            }
        }

        let expanded = lookup(index, path)?
            .as_directory()
            .cloned()
            .ok_or_else(|| MirrorError::NotADirectory(path.to_string()))?;
        tracing::debug!("Expanded {}: {}", path, index.debug_summary());
        self.publish(state);
        Ok(expanded)
    }

    /// Load a file's content into its entry and the content cache.
    pub async fn open_file(&self, path: &str) -> Result<FileEntry> {
        validate_path(path)?;
        let _pause = self.shared.gate.pause().await;

        let handle = {
            let state = self.shared.state.read().await;
            root_info(&state)?;
            lookup_file(&state.index, path)?.handle.clone()
        };

        let bytes = handle
            .read()
            .await
            .map_err(|e| MirrorError::external("read", path, e))?;
        let metadata = handle
            .metadata()
            .await
            .map_err(|e| MirrorError::external("read metadata of", path, e))?;
        let content = String::from_utf8_lossy(&bytes).into_owned();

        let mut guard = self.shared.state.write().await;
        let state = &mut *guard;
        lookup_file(&state.index, path)?;

        let index = Arc::make_mut(&mut state.index);
        let Some(file) = index.get_mut(path).and_then(Entry::as_file_mut) else {
            return Err(MirrorError::NotFound(path.to_string()));
        };
        file.apply_metadata(metadata);
        file.open_with(content.clone());
        let opened = file.clone();

        state.cache.insert(path.to_string(), content, metadata.last_modified);
        tracing::debug!("Opened {} ({} bytes)", path, opened.size);
        self.publish(state);
        Ok(opened)
    }

    /// Drop a file's content and its cache entry.
    pub async fn close_file(&self, path: &str) -> Result<FileEntry> {
        validate_path(path)?;
        let _pause = self.shared.gate.pause().await;

        let mut guard = self.shared.state.write().await;
        let state = &mut *guard;
        root_info(state)?;
        lookup_file(&state.index, path)?;

        let index = Arc::make_mut(&mut state.index);
        let Some(file) = index.get_mut(path).and_then(Entry::as_file_mut) else {
            return Err(MirrorError::NotFound(path.to_string()));
        };
        file.close();
        let closed = file.clone();

        state.cache.remove(path);
        tracing::debug!("Closed {}", path);
        self.publish(state);
        Ok(closed)
    }

    /// Snapshot of the live index.
    pub async fn index(&self) -> Arc<EntryIndex> {
        Arc::clone(&self.shared.state.read().await.index)
    }

    /// The entry at `path` in the live index.
    pub async fn entry(&self, path: &str) -> Option<Entry> {
        self.shared.state.read().await.index.get(path).cloned()
    }

    /// Whether `path` is a directory the poll cycle re-walks.
    pub async fn is_watched(&self, path: &str) -> bool {
        self.shared.state.read().await.watch.contains(path)
    }

    /// Whether the content cache holds an entry for `path`.
    pub async fn is_cached(&self, path: &str) -> bool {
        self.shared.state.read().await.cache.contains(path)
    }

    /// Subscribe to the debounced index.
    pub fn subscribe(&self) -> watch::Receiver<Arc<EntryIndex>> {
        self.shared.publisher.subscribe()
    }

    /// Subscribe to change sets published by poll cycles.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeSet> {
        self.shared.changes.subscribe()
    }

    /// The session pipeline, or a fresh one if no session is active.
    pub(crate) async fn current_pipeline(&self) -> Arc<FilterPipeline> {
        if let Some(filters) = &self.shared.state.read().await.filters {
            return Arc::clone(filters);
        }
        let pipeline = Arc::new(FilterPipeline::build(&self.shared.factories).await);
        self.shared.state.write().await.filters = Some(Arc::clone(&pipeline));
        pipeline
    }

    /// The open root, checked for write access.
    pub(crate) async fn writable_root(&self) -> Result<RootInfo> {
        let root = root_info(&*self.shared.state.read().await)?.clone();
        if root.mode != AccessMode::ReadWrite {
            return Err(MirrorError::PermissionDenied(root.path));
        }
        if root.handle.query_permission(AccessMode::ReadWrite).await != PermissionState::Granted {
            tracing::warn!("Write access to {} was revoked", root.path);
            return Err(MirrorError::PermissionDenied(root.path));
        }
        Ok(root)
    }

    pub(crate) fn publish(&self, state: &MirrorState) {
        self.shared.publisher.publish(Arc::clone(&state.index));
    }
}

impl Default for Mirror {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("config", &self.shared.config)
            .field("engine_state", &self.shared.gate.state())
            .finish()
    }
}

pub(crate) fn root_info(state: &MirrorState) -> Result<&RootInfo> {
    state.root.as_ref().ok_or(MirrorError::NoRoot)
}

pub(crate) fn validate_path(path: &str) -> Result<()> {
    if is_valid_path(path) {
        Ok(())
    } else {
        Err(MirrorError::invalid(path, "malformed path"))
    }
}

pub(crate) fn lookup<'a>(index: &'a EntryIndex, path: &str) -> Result<&'a Entry> {
    index
        .get(path)
        .ok_or_else(|| MirrorError::NotFound(path.to_string()))
}

pub(crate) fn lookup_file<'a>(index: &'a EntryIndex, path: &str) -> Result<&'a FileEntry> {
    lookup(index, path)?
        .as_file()
        .ok_or_else(|| MirrorError::NotAFile(path.to_string()))
}

/// The directory entry containing `path`.
pub(crate) fn parent_dir<'a>(index: &'a EntryIndex, path: &str) -> Result<&'a DirectoryEntry> {
    let parent = parent_path(path).ok_or_else(|| MirrorError::invalid(path, "the root has no parent"))?;
    lookup(index, parent)?
        .as_directory()
        .ok_or_else(|| MirrorError::NotADirectory(parent.to_string()))
}

/// Builder for [`Mirror`] with sensible defaults.
pub struct MirrorBuilder {
    config: MirrorConfig,
    factories: Vec<Arc<dyn FilterFactory>>,
    callbacks: ChangeCallbacks,
    root_store: Option<Arc<dyn RootStore>>,
}

impl MirrorBuilder {
    /// Default configuration, default filters, no callbacks.
    pub fn new() -> Self {
        Self {
            config: MirrorConfig::default(),
            factories: default_filters(),
            callbacks: ChangeCallbacks::default(),
            root_store: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: MirrorConfig) -> Self {
        self.config = config;
        self
    }

    /// Levels loaded by `open_root` and `expand_directory`. At least 1.
    pub fn load_depth(mut self, depth: usize) -> Self {
        self.config.load_depth = depth.max(1);
        self
    }

    /// Time between poll cycles.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Age after which cached content is re-read.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Capacity of the content cache.
    pub fn max_cached_files(mut self, max: usize) -> Self {
        self.config.max_cached_files = max;
        self
    }

    /// Directories with more children are skipped by poll cycles.
    pub fn max_directory_entries(mut self, max: usize) -> Self {
        self.config.max_directory_entries = max;
        self
    }

    /// Paths classified concurrently per batch. At least 1.
    pub fn classify_batch_size(mut self, size: usize) -> Self {
        self.config.classify_batch_size = size.max(1);
        self
    }

    /// Debounce window of [`Mirror::subscribe`].
    pub fn publish_delay(mut self, delay: Duration) -> Self {
        self.config.publish_delay = delay;
        self
    }

    /// Capacity of the change set broadcast. At least 1.
    pub fn change_buffer(mut self, size: usize) -> Self {
        self.config.change_buffer = size.max(1);
        self
    }

    /// Replace the filter factories. An empty list mirrors everything.
    pub fn filters(mut self, factories: Vec<Arc<dyn FilterFactory>>) -> Self {
        self.factories = factories;
        self
    }

    /// Called with the added entries of each published cycle.
    pub fn on_added(mut self, callback: EntriesCallback) -> Self {
        self.callbacks.on_added = Some(callback);
        self
    }

    /// Called with the deleted entries of each published cycle.
    pub fn on_deleted(mut self, callback: EntriesCallback) -> Self {
        self.callbacks.on_deleted = Some(callback);
        self
    }

    /// Called with the modified opened files of each published cycle.
    pub fn on_modified(mut self, callback: ModifiedCallback) -> Self {
        self.callbacks.on_modified = Some(callback);
        self
    }

    /// Remember every opened root in `store`.
    pub fn root_store(mut self, store: Arc<dyn RootStore>) -> Self {
        self.root_store = Some(store);
        self
    }

    /// Build the mirror. Must be called inside a tokio runtime.
    pub fn build(self) -> Mirror {
        let (changes, _) = broadcast::channel(self.config.change_buffer.max(1));
        let publisher = IndexPublisher::new(self.config.publish_delay);
        Mirror {
            shared: Arc::new(Shared {
                state: RwLock::new(MirrorState::empty(&self.config)),
                gate: EngineGate::new(),
                factories: self.factories,
                callbacks: self.callbacks,
                changes,
                publisher,
                root_store: self.root_store,
                ticker: parking_lot::Mutex::new(None),
                config: self.config,
            }),
        }
    }
}

impl Default for MirrorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
