//! Structural mutations: write, create, delete, rename and copy.
//!
//! Each operation validates its arguments, resolves the parent from the live
//! index, performs the external calls and only then edits the index, watch
//! index and content cache. Every operation holds the engine pause guard for
//! its whole duration.

use crate::error::{MirrorError, Result};
use crate::mirror::entry::{
    file_name, is_valid_name, is_within, join_path, parent_path, DirectoryEntry, Entry, FileEntry,
};
use crate::mirror::model::{lookup, parent_dir, validate_path, Mirror, MirrorState};
use crate::mirror::tree_store::EntryIndex;
use crate::store::{child_names, DirRef, FileRef, Handle};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;

/// Options for [`Mirror::write_file`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Create a new file under a collision-free name instead of writing to
    /// an existing one.
    pub create: bool,
}

impl WriteOptions {
    /// Options that create a new file.
    pub fn create() -> Self {
        Self { create: true }
    }
}

/// What happens to the source once a subtree has been copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transfer {
    Keep,
    Remove,
}

impl Mirror {
    /// Write `data` to the file at `path`, or create a new file next to it.
    ///
    /// With `options.create` the file name is made unique among the parent's
    /// children. Without it the file must already exist. `data == None` only
    /// resolves (or creates) the file.
    pub async fn write_file(
        &self,
        path: &str,
        options: WriteOptions,
        data: Option<&[u8]>,
    ) -> Result<FileEntry> {
        validate_path(path)?;
        let parent = parent_path(path).ok_or_else(|| MirrorError::invalid(path, "cannot write the root"))?;
        let name = file_name(path);
        let _pause = self.shared.gate.pause().await;
        self.writable_root().await?;

        let parent_handle = {
            let state = self.shared.state.read().await;
            if state.index.get(path).is_some_and(Entry::is_dir) {
                return Err(MirrorError::NotAFile(path.to_string()));
            }
            parent_dir(&state.index, path)?.handle.clone()
        };

        let (file, resolved, created) = if options.create {
            let names = child_names(&parent_handle)
                .await
                .map_err(|e| MirrorError::external("enumerate", parent, e))?;
            let resolved = unique_name(name, &names, None);
            let file = parent_handle
                .file(&resolved, true)
                .await
                .map_err(|e| MirrorError::external("create", join_path(parent, &resolved), e))?;
            (file, resolved, true)
        } else {
            let file = parent_handle.file(name, false).await.map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    MirrorError::conflict(path, "file does not exist")
                } else {
                    MirrorError::external("open", path, e)
                }
            })?;
            (file, name.to_string(), false)
        };
        let final_path = join_path(parent, &resolved);

        if let Some(data) = data {
            if let Err(e) = write_contents(&file, data, &final_path).await {
                if created {
                    if let Err(cleanup) = parent_handle.remove_entry(&resolved, false).await {
                        tracing::warn!("Failed to remove partial file {}: {}", final_path, cleanup);
                    }
                }
                return Err(e);
            }
        }
        let metadata = file
            .metadata()
            .await
            .map_err(|e| MirrorError::external("read metadata of", final_path.clone(), e))?;

        let mut guard = self.shared.state.write().await;
        let state = &mut *guard;
        let mut entry = match state.index.get(&final_path) {
            Some(Entry::File(existing)) => existing.clone(),
            _ => FileEntry::new(final_path.clone(), file.clone(), metadata),
        };
        entry.handle = file;
        entry.apply_metadata(metadata);

        if let Some(data) = data {
            let content = String::from_utf8_lossy(data).into_owned();
            if entry.opened {
                entry.open_with(content.clone());
            }
            if state.cache.contains(&final_path) {
                state.cache.insert(final_path.clone(), content, metadata.last_modified);
            }
        }

        if state.index.get(parent).is_some_and(Entry::is_loaded_dir) {
            Arc::make_mut(&mut state.index).insert(Entry::File(entry.clone()));
            self.publish(state);
        }
        tracing::debug!("Wrote {} ({} bytes)", final_path, entry.size);
        Ok(entry)
    }

    /// Create a directory called `name` (or a unique variant of it) under
    /// `parent_path`.
    pub async fn create_directory(&self, name: &str, parent_path: &str) -> Result<DirectoryEntry> {
        if !is_valid_name(name) {
            return Err(MirrorError::invalid(name, "invalid directory name"));
        }
        validate_path(parent_path)?;
        let _pause = self.shared.gate.pause().await;
        self.writable_root().await?;

        let parent_handle = {
            let state = self.shared.state.read().await;
            lookup(&state.index, parent_path)?
                .as_directory()
                .ok_or_else(|| MirrorError::NotADirectory(parent_path.to_string()))?
                .handle
                .clone()
        };

        let names = child_names(&parent_handle)
            .await
            .map_err(|e| MirrorError::external("enumerate", parent_path, e))?;
        let resolved = unique_name(name, &names, None);
        let path = join_path(parent_path, &resolved);
        let handle = parent_handle
            .directory(&resolved, true)
            .await
            .map_err(|e| MirrorError::external("create", path.clone(), e))?;
        let entry = DirectoryEntry::new(path, handle, false);

        let mut guard = self.shared.state.write().await;
        let state = &mut *guard;
        if state.index.get(parent_path).is_some_and(Entry::is_loaded_dir) {
            Arc::make_mut(&mut state.index).insert(Entry::Directory(entry.clone()));
            self.publish(state);
        }
        tracing::debug!("Created directory {}", entry.path);
        Ok(entry)
    }

    /// Delete the entry at `path`. Non-empty directories need `recursive`.
    pub async fn delete_entry(&self, path: &str, recursive: bool) -> Result<Entry> {
        validate_path(path)?;
        if parent_path(path).is_none() {
            return Err(MirrorError::invalid(path, "cannot delete the root"));
        }
        let _pause = self.shared.gate.pause().await;
        self.writable_root().await?;

        let (target, parent_handle, descendants) = {
            let state = self.shared.state.read().await;
            let target = lookup(&state.index, path)?.clone();
            let parent_handle = parent_dir(&state.index, path)?.handle.clone();
            let descendants = if target.is_dir() {
                state.index.descendants(path)
            } else {
                Vec::new()
            };
            (target, parent_handle, descendants)
        };

        parent_handle
            .remove_entry(target.name(), recursive)
            .await
            .map_err(|e| MirrorError::external("remove", path, e))?;

        let mut guard = self.shared.state.write().await;
        let state = &mut *guard;
        let index = Arc::make_mut(&mut state.index);
        for descendant in &descendants {
            index.remove(descendant);
            state.cache.remove(descendant);
        }
        index.remove_subtree(path);
        state.cache.remove(path);
        state.watch.prune_under(path);
        tracing::debug!("Deleted {} and {} entries below it", path, descendants.len());
        self.publish(state);
        Ok(target)
    }

    /// Rename the entry at `path` within its directory.
    ///
    /// Renaming to the current name does nothing. Otherwise the name is made
    /// unique among the siblings, the content (or whole subtree) is copied to
    /// it and the old resource is removed unless the two names differ only in
    /// case.
    pub async fn rename_entry(&self, path: &str, new_name: &str) -> Result<Entry> {
        validate_path(path)?;
        if !is_valid_name(new_name) {
            return Err(MirrorError::invalid(new_name, "invalid entry name"));
        }
        let parent = parent_path(path).ok_or_else(|| MirrorError::invalid(path, "cannot rename the root"))?;
        let _pause = self.shared.gate.pause().await;
        self.writable_root().await?;

        let (source, parent_handle, live) = {
            let state = self.shared.state.read().await;
            let source = lookup(&state.index, path)?.clone();
            let parent_handle = parent_dir(&state.index, path)?.handle.clone();
            (source, parent_handle, Arc::clone(&state.index))
        };
        if source.name() == new_name {
            return Ok(source);
        }

        let names = child_names(&parent_handle)
            .await
            .map_err(|e| MirrorError::external("enumerate", parent, e))?;
        let resolved = unique_name(new_name, &names, Some(source.name()));
        let transfer = if resolved.eq_ignore_ascii_case(source.name()) {
            Transfer::Keep
        } else {
            Transfer::Remove
        };

        let new_path = join_path(parent, &resolved);
        let scratch = rebuild_subtree(
            &source,
            &parent_handle,
            &parent_handle,
            &new_path,
            &live,
            transfer,
        )
        .await?;

        let mut guard = self.shared.state.write().await;
        let state = &mut *guard;
        retire_subtree(state, path, Some((new_path.as_str(), &scratch)));
        let renamed = attach_subtree(state, &new_path, scratch)?;
        tracing::debug!("Renamed {} to {}", path, new_path);
        self.publish(state);
        Ok(renamed)
    }

    /// Copy the entry at `path` into the directory `destination`.
    ///
    /// An entry of the same name in `destination` is a conflict unless
    /// `replace` is set. With `replace` the existing entry gives way once the
    /// copy has been staged next to it, and the source is removed after the
    /// copy, turning the copy into a move.
    pub async fn copy_entry(&self, path: &str, destination: &str, replace: bool) -> Result<Entry> {
        validate_path(path)?;
        validate_path(destination)?;
        if is_within(destination, path) {
            return Err(MirrorError::InvalidTopology {
                source_path: path.to_string(),
                destination: destination.to_string(),
            });
        }
        let _pause = self.shared.gate.pause().await;
        self.writable_root().await?;

        let (source, source_parent, dest_handle, live) = {
            let state = self.shared.state.read().await;
            let source = lookup(&state.index, path)?.clone();
            let source_parent = parent_dir(&state.index, path)?.handle.clone();
            let dest_handle = lookup(&state.index, destination)?
                .as_directory()
                .ok_or_else(|| MirrorError::NotADirectory(destination.to_string()))?
                .handle
                .clone();
            (source, source_parent, dest_handle, Arc::clone(&state.index))
        };

        let new_path = join_path(destination, source.name());
        if parent_path(path) == Some(destination) {
            if replace {
                return Ok(source);
            }
            return Err(MirrorError::conflict(new_path, "an entry with this name already exists"));
        }

        let names = child_names(&dest_handle)
            .await
            .map_err(|e| MirrorError::external("enumerate", destination, e))?;
        let occupied = names.iter().any(|name| name == source.name());
        if occupied && !replace {
            return Err(MirrorError::conflict(new_path, "an entry with this name already exists"));
        }

        let scratch = if occupied {
            self.replace_existing(&source, &dest_handle, destination, &names, &live)
                .await?
        } else {
            copy_subtree(source.handle(), path, &dest_handle, &new_path, &live, true).await?
        };

        // A source that cannot be removed leaves a plain copy behind.
        let mut transfer = if replace { Transfer::Remove } else { Transfer::Keep };
        let mut removal = Ok(());
        if transfer == Transfer::Remove {
            if let Err(e) = source_parent.remove_entry(source.name(), true).await {
                transfer = Transfer::Keep;
                removal = Err(MirrorError::external("remove", path, e));
            }
        }

        let mut guard = self.shared.state.write().await;
        let state = &mut *guard;
        retire_subtree(state, &new_path, None);
        let dest_loaded = state.index.get(destination).is_some_and(Entry::is_loaded_dir);
        match transfer {
            Transfer::Remove if dest_loaded => retire_subtree(state, path, Some((new_path.as_str(), &scratch))),
            Transfer::Remove => retire_subtree(state, path, None),
            Transfer::Keep => {
                for copied in scratch.paths() {
                    state.cache.duplicate(&rebase(copied, &new_path, path), copied.clone());
                }
            }
        }

        let copied = if dest_loaded {
            attach_subtree(state, &new_path, scratch)?
        } else {
            lookup(&scratch, &new_path)?.clone()
        };
        tracing::debug!("Copied {} to {}", path, new_path);
        self.publish(state);
        removal.map(|()| copied)
    }

    /// Copy `source` over the same-name entry in `dest`.
    ///
    /// The copy is first made under a free staging name, so a failing copy
    /// leaves the existing entry untouched. Only then is the existing entry
    /// removed and the staged copy moved into its place.
    async fn replace_existing(
        &self,
        source: &Entry,
        dest: &DirRef,
        destination: &str,
        names: &[String],
        live: &EntryIndex,
    ) -> Result<EntryIndex> {
        let new_path = join_path(destination, source.name());
        let staging = unique_name(source.name(), names, None);
        let staging_path = join_path(destination, &staging);
        let staged = copy_subtree(source.handle(), source.path(), dest, &staging_path, live, true).await?;
        let staged_handle = lookup(&staged, &staging_path)?.handle();

        if let Err(e) = dest.remove_entry(source.name(), true).await {
            discard(dest, &staging, &staging_path).await;
            return Err(MirrorError::external("remove", new_path, e));
        }
        let promoted = copy_subtree(staged_handle, source.path(), dest, &new_path, live, true).await;
        discard(dest, &staging, &staging_path).await;

        if promoted.is_err() {
            // The replaced entry is gone from the store by now.
            let mut guard = self.shared.state.write().await;
            let state = &mut *guard;
            if state.index.contains(&new_path) {
                retire_subtree(state, &new_path, None);
                self.publish(state);
            }
        }
        promoted
    }
}

/// Copy the external subtree of `source` to `new_path` under `dest`.
///
/// With [`Transfer::Remove`] the source resource is removed from
/// `source_parent` once the copy is complete. `Transfer::Keep` is only used
/// for case-only renames, where the new name may address the source itself,
/// so a failed copy is not cleaned up in that case.
pub(crate) async fn rebuild_subtree(
    source: &Entry,
    source_parent: &DirRef,
    dest: &DirRef,
    new_path: &str,
    live: &EntryIndex,
    transfer: Transfer,
) -> Result<EntryIndex> {
    let fresh = transfer == Transfer::Remove;
    let scratch = copy_subtree(source.handle(), source.path(), dest, new_path, live, fresh).await?;

    if transfer == Transfer::Remove {
        source_parent
            .remove_entry(source.name(), true)
            .await
            .map_err(|e| MirrorError::external("remove", source.path(), e))?;
    }
    Ok(scratch)
}

/// Copy `from` to `new_path` under `dest` and return the replacement entries.
///
/// Entries are built in a scratch index only for paths below `source_path`
/// that were materialized in `live`, keeping their `opened`/`loaded` state.
/// Nothing in `live` is touched. When `fresh` is set, `new_path` did not
/// exist before and whatever the copy created is removed again if it fails.
async fn copy_subtree(
    from: Handle,
    source_path: &str,
    dest: &DirRef,
    new_path: &str,
    live: &EntryIndex,
    fresh: bool,
) -> Result<EntryIndex> {
    let name = file_name(new_path);
    let mut scratch = EntryIndex::new();
    let copied = copy_tree(
        from,
        dest.clone(),
        name.to_string(),
        source_path.to_string(),
        new_path.to_string(),
        live,
        &mut scratch,
    )
    .await;

    if let Err(e) = copied {
        if fresh {
            discard(dest, name, new_path).await;
        }
        return Err(e);
    }
    Ok(scratch)
}

/// Best-effort removal of a partial or temporary copy.
async fn discard(dest: &DirRef, name: &str, path: &str) {
    if let Err(e) = dest.remove_entry(name, true).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove partial copy {}: {}", path, e);
        }
    }
}

fn copy_tree<'a>(
    source: Handle,
    dest: DirRef,
    name: String,
    old_path: String,
    new_path: String,
    live: &'a EntryIndex,
    scratch: &'a mut EntryIndex,
) -> BoxFuture<'a, Result<()>> {
    async move {
        match source {
            Handle::File(file) => {
                let data = file
                    .read()
                    .await
                    .map_err(|e| MirrorError::external("read", old_path.clone(), e))?;
                let copy = dest
                    .file(&name, true)
                    .await
                    .map_err(|e| MirrorError::external("create", new_path.clone(), e))?;
                write_contents(&copy, &data, &new_path).await?;

                if let Some(Entry::File(previous)) = live.get(&old_path) {
                    let metadata = copy
                        .metadata()
                        .await
                        .map_err(|e| MirrorError::external("read metadata of", new_path.clone(), e))?;
                    let mut entry = FileEntry::new(new_path, copy, metadata);
                    if let Some(content) = &previous.content {
                        entry.open_with(content.clone());
                    }
                    scratch.insert(Entry::File(entry));
                }
            }
            Handle::Directory(dir) => {
                let copy = dest
                    .directory(&name, true)
                    .await
                    .map_err(|e| MirrorError::external("create", new_path.clone(), e))?;
                let children = dir
                    .entries()
                    .await
                    .map_err(|e| MirrorError::external("enumerate", old_path.clone(), e))?;
                for child in children {
                    let child_name = child.name().to_string();
                    copy_tree(
                        child,
                        copy.clone(),
                        child_name.clone(),
                        join_path(&old_path, &child_name),
                        join_path(&new_path, &child_name),
                        live,
                        &mut *scratch,
                    )
                    .await?;
                }

                if let Some(Entry::Directory(previous)) = live.get(&old_path) {
                    scratch.insert(Entry::Directory(DirectoryEntry::new(new_path, copy, previous.loaded)));
                }
            }
        }
        Ok(())
    }
    .boxed()
}

/// Remove `path` and its subtree from the index, watch index and cache.
///
/// With `moved_to = Some((new_root, scratch))`, cache entries whose path has
/// a counterpart in `scratch` follow it instead of being dropped.
fn retire_subtree(state: &mut MirrorState, path: &str, moved_to: Option<(&str, &EntryIndex)>) {
    if !state.index.contains(path) {
        return;
    }
    let removed = Arc::make_mut(&mut state.index).remove_subtree(path);
    for entry in &removed {
        let old = entry.path();
        match moved_to {
            Some((new_root, scratch)) if scratch.contains(&rebase(old, path, new_root)) => {
                state.cache.rename(old, rebase(old, path, new_root));
            }
            _ => {
                state.cache.remove(old);
            }
        }
    }
    state.watch.prune_under(path);
}

/// Merge a rebuilt subtree into the live index and return its top entry.
fn attach_subtree(state: &mut MirrorState, root: &str, scratch: EntryIndex) -> Result<Entry> {
    let top = lookup(&scratch, root)?.clone();
    state.watch.register_loaded(&scratch, root);
    Arc::make_mut(&mut state.index).extend(scratch);
    Ok(top)
}

/// Move `path` from below `from` to the same place below `to`.
fn rebase(path: &str, from: &str, to: &str) -> String {
    format!("{to}{}", &path[from.len()..])
}

/// Write `data` through a fresh writable stream, aborting it on failure.
async fn write_contents(file: &FileRef, data: &[u8], path: &str) -> Result<()> {
    let mut stream = file
        .create_writable()
        .await
        .map_err(|e| MirrorError::external("open for writing", path, e))?;

    let written = match stream.write(data).await {
        Ok(()) => stream.close().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        if let Err(abort) = stream.abort().await {
            tracing::warn!("Failed to abort write to {}: {}", path, abort);
        }
        return Err(MirrorError::external("write", path, e));
    }
    Ok(())
}

/// `desired`, or the first `stem (n).ext` variant not taken in `existing`.
///
/// Names compare case-insensitively. `own` is the current name of the entry
/// being renamed, which never collides with itself.
pub(crate) fn unique_name(desired: &str, existing: &[String], own: Option<&str>) -> String {
    let taken: HashSet<String> = existing
        .iter()
        .filter(|name| Some(name.as_str()) != own)
        .map(|name| name.to_lowercase())
        .collect();
    if !taken.contains(&desired.to_lowercase()) {
        return desired.to_string();
    }

    let (stem, extension) = match desired.rfind('.') {
        Some(dot) if dot > 0 => desired.split_at(dot),
        _ => (desired, ""),
    };
    let mut n = 1;
    loop {
        let candidate = format!("{stem} ({n}){extension}");
        if !taken.contains(&candidate.to_lowercase()) {
            return candidate;
        }
        n += 1;
    }
}
