//! Scoped Mirror
//!
//! An incremental, path-indexed mirror of a permission-scoped directory tree
//! that is reachable only through opaque capability handles.
//!
//! ## What it does
//!
//! - Keeps a flat `path → entry` index of the known tree, materializing
//!   subtrees lazily as directories are expanded
//! - Runs every entry through an ordered filter pipeline (VCS metadata,
//!   build output, `.gitignore` rules)
//! - Performs write/create/delete/rename/copy against the store and keeps the
//!   index consistent with the result
//! - Polls the loaded part of the tree, diffs it against the previous snapshot
//!   and reports added, deleted and modified entries
//!
//! ## Flow
//!
//! ```text
//! Root handle (DirectoryHandle)
//!        ↓
//! Mirror::open_root() → TreeLoader → EntryIndex + WatchIndex
//!        ↓
//! poll cycle every poll_interval [paused while a mutation runs]
//!        ↓
//! re-walk watched dirs → filter → classify against baseline
//!        ↓
//! callbacks + broadcast(ChangeSet) → swap index
//!        ↓
//! IndexPublisher (debounced watch channel)
//! ```
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use scoped_mirror::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let root = LocalStore::open("/path/to/project").await?;
//!
//!     let mirror = Mirror::builder()
//!         .load_depth(2)
//!         .on_added(Box::new(|added| println!("{} entries added", added.len())))
//!         .build();
//!
//!     mirror.open_root(root, AccessMode::ReadWrite).await?;
//!     mirror.expand_directory("project/src").await?;
//!     mirror.start_watching();
//!
//!     let mut index = mirror.subscribe();
//!     index.changed().await?;
//!     println!("{} entries mirrored", index.borrow().len());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Structure
//!
//! - [`store`]: capability interface to the external store, with in-memory and
//!   local filesystem implementations
//! - [`mirror`]: the engine
//!   - [`mirror::model`]: the `Mirror` object and its configuration
//!   - [`mirror::ops`]: mutations
//!   - [`mirror::watcher`]: polling change detection
//! - [`persist`]: remembered roots
//! - [`error`]: error taxonomy

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod mirror;
pub mod persist;
pub mod store;

/// Re-exports for convenience.
pub mod prelude {
    pub use crate::error::{ErrorKind, MirrorError, Result};
    pub use crate::mirror::{
        ChangeSet, CycleOutcome, DirectoryEntry, EngineState, Entry, EntryIndex, FileEntry,
        Filter, FilterFactory, Mirror, MirrorBuilder, MirrorConfig, WriteOptions,
    };
    pub use crate::persist::{MemoryRootStore, RootStore};
    pub use crate::store::{
        AccessMode, DirRef, DirectoryHandle, FileHandle, FileRef, Handle, LocalStore,
        MemoryStore, PermissionState,
    };
}
