//! Mirror engine module.
//!
//! This module provides:
//! - `entry` / `tree_store`: entry records, the path index and the watch index
//! - `filter`: the filter pipeline and the default filters
//! - `loader`: depth-bounded subtree loading
//! - `model` / `ops`: the `Mirror` engine and its mutations
//! - `watcher`: polling change detection
//! - `publish`: debounced publication of the index

pub mod cache;
pub mod entry;
pub mod filter;
pub mod gate;
pub mod loader;
pub mod model;
pub mod ops;
pub mod publish;
pub mod tree_store;
pub mod watcher;

pub use cache::ContentCache;
pub use entry::{DirectoryEntry, Entry, FileEntry};
pub use filter::{
    default_filters, ExcludedDirectories, Filter, FilterFactory, FilterPipeline, GitignoreFactory,
    GitignoreFilter,
};
pub use gate::EngineState;
pub use model::{Mirror, MirrorBuilder, MirrorConfig};
pub use ops::WriteOptions;
pub use publish::IndexPublisher;
pub use tree_store::{EntryIndex, WatchIndex};
pub use watcher::{ChangeCallbacks, ChangeSet, CycleOutcome, EntriesCallback, ModifiedCallback};
