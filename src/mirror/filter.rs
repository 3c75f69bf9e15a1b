//! Ordered, stateful filter pipeline deciding which entries are mirrored.
//!
//! Each filter comes from an async factory, so a fresh pipeline (with fresh
//! lazily-built state) is created for every open and every poll cycle. The
//! pipeline short-circuits on the first filter that excludes a path.
//!
//! Some decisions depend on siblings, e.g. a `.gitignore` discovered halfway
//! through a directory. Callers therefore run [`FilterPipeline::sweep`] once a
//! walk has finished, which re-applies the now fully initialised pipeline to
//! everything that was kept.

use crate::mirror::entry::{file_name, is_within, parent_path};
use crate::mirror::tree_store::EntryIndex;
use crate::store::Handle;
use async_trait::async_trait;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::Match;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Directory names excluded by default: VCS metadata, build output and
/// vendored dependencies.
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "dist",
    "build",
];

/// A single exclusion rule.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Whether the entry at `path` should be left out of the mirror.
    async fn ignore(&self, path: &str, handle: &Handle) -> bool;
}

/// Builds a filter, possibly after some one-time async setup.
#[async_trait]
pub trait FilterFactory: Send + Sync {
    /// Create a filter with fresh state.
    async fn create(&self) -> Box<dyn Filter>;
}

/// The factories installed when nothing else is configured.
pub fn default_filters() -> Vec<Arc<dyn FilterFactory>> {
    vec![
        Arc::new(ExcludedDirectories::default()),
        Arc::new(GitignoreFactory),
    ]
}

/// Filters evaluated in order.
pub struct FilterPipeline {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterPipeline {
    /// Instantiate every factory, in order.
    pub async fn build(factories: &[Arc<dyn FilterFactory>]) -> Self {
        let mut filters = Vec::with_capacity(factories.len());
        for factory in factories {
            filters.push(factory.create().await);
        }
        Self { filters }
    }

    /// A pipeline that keeps everything.
    pub fn empty() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    /// Number of filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Check if the pipeline has no filters.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Whether any filter excludes `path`. Stops at the first that does.
    pub async fn ignore(&self, path: &str, handle: &Handle) -> bool {
        for filter in &self.filters {
            if filter.ignore(path, handle).await {
                tracing::trace!("Filtered out {}", path);
                return true;
            }
        }
        false
    }

    /// Re-apply the pipeline to every entry of `index`, removing excluded
    /// entries together with their descendants. Returns the removed paths.
    pub async fn sweep(&self, index: &mut EntryIndex) -> Vec<String> {
        self.sweep_within(index, None).await
    }

    /// Like [`sweep`](Self::sweep), restricted to entries at or below `scope`.
    pub async fn sweep_within(&self, index: &mut EntryIndex, scope: Option<&str>) -> Vec<String> {
        if self.filters.is_empty() {
            return Vec::new();
        }

        let candidates: Vec<(String, Handle)> = index
            .iter()
            .filter(|(path, _)| scope.map_or(true, |scope| is_within(path, scope)))
            .map(|(path, entry)| (path.clone(), entry.handle()))
            .collect();

        let mut removed = Vec::new();
        for (path, handle) in candidates {
            if self.ignore(&path, &handle).await {
                removed.extend(
                    index
                        .remove_subtree(&path)
                        .into_iter()
                        .map(|entry| entry.path().to_string()),
                );
            }
        }
        removed
    }
}

impl std::fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterPipeline")
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// Excludes directories by name.
#[derive(Debug, Clone)]
pub struct ExcludedDirectories {
    names: HashSet<String>,
}

impl ExcludedDirectories {
    /// Exclude directories with any of `names`.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for ExcludedDirectories {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUDED_DIRS.iter().copied())
    }
}

#[async_trait]
impl Filter for ExcludedDirectories {
    async fn ignore(&self, path: &str, handle: &Handle) -> bool {
        handle.is_dir() && parent_path(path).is_some() && self.names.contains(file_name(path))
    }
}

#[async_trait]
impl FilterFactory for ExcludedDirectories {
    async fn create(&self) -> Box<dyn Filter> {
        Box::new(self.clone())
    }
}

/// Factory for [`GitignoreFilter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GitignoreFactory;

#[async_trait]
impl FilterFactory for GitignoreFactory {
    async fn create(&self) -> Box<dyn Filter> {
        Box::new(GitignoreFilter::default())
    }
}

/// Applies `.gitignore` rules.
///
/// A `.gitignore` is read the first time the filter is asked about it and its
/// rules then apply to every path below its directory.
#[derive(Default)]
pub struct GitignoreFilter {
    rules: Mutex<HashMap<String, Gitignore>>,
}

impl GitignoreFilter {
    async fn load_rules(&self, path: &str, handle: &Handle) {
        let Handle::File(file) = handle else {
            return;
        };
        let Some(dir) = parent_path(path) else {
            return;
        };
        if self.rules.lock().contains_key(dir) {
            return;
        }

        let content = match file.read().await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!("Failed to read ignore rules {}: {}", path, e);
                return;
            }
        };

        let mut builder = GitignoreBuilder::new(dir);
        for line in content.lines() {
            if let Err(e) = builder.add_line(None, line) {
                tracing::warn!("Skipping ignore rule {:?} in {}: {}", line, path, e);
            }
        }
        match builder.build() {
            Ok(gitignore) => {
                tracing::debug!("Loaded {} ignore rules from {}", gitignore.num_ignores(), path);
                self.rules.lock().insert(dir.to_string(), gitignore);
            }
            Err(e) => tracing::warn!("Failed to build ignore rules from {}: {}", path, e),
        }
    }
}

#[async_trait]
impl Filter for GitignoreFilter {
    async fn ignore(&self, path: &str, handle: &Handle) -> bool {
        if !handle.is_dir() && file_name(path) == ".gitignore" {
            self.load_rules(path, handle).await;
            return false;
        }

        // The closest rules file with an opinion decides, so a nested
        // `!pattern` can re-include what an outer file excludes.
        let rules = self.rules.lock();
        let mut dir = parent_path(path);
        while let Some(current) = dir {
            if let Some(gitignore) = rules.get(current) {
                match gitignore.matched_path_or_any_parents(path, handle.is_dir()) {
                    Match::Ignore(_) => return true,
                    Match::Whitelist(_) => return false,
                    Match::None => {}
                }
            }
            dir = parent_path(current);
        }
        false
    }
}
