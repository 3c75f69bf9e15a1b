//! Debounced publication of the live index.
//!
//! Every committed change hands the new `Arc<EntryIndex>` to the publisher.
//! Updates arriving within the delay window of each other collapse into the
//! last one, so downstream consumers see at most one refresh per burst.

use crate::mirror::tree_store::EntryIndex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Trailing-edge debouncer feeding a `watch` channel.
///
/// Must be created inside a tokio runtime.
pub struct IndexPublisher {
    pending: mpsc::UnboundedSender<Arc<EntryIndex>>,
    published: watch::Receiver<Arc<EntryIndex>>,
    task: JoinHandle<()>,
}

impl IndexPublisher {
    /// Start the debounce task.
    ///
    /// # Arguments
    /// * `delay` - Quiet period after the last update before it is published.
    pub fn new(delay: Duration) -> Self {
        let (pending, rx) = mpsc::unbounded_channel();
        let (tx, published) = watch::channel(Arc::new(EntryIndex::new()));
        let task = tokio::spawn(debounce_loop(rx, tx, delay));
        Self {
            pending,
            published,
            task,
        }
    }

    /// Queue a new index value for publication.
    pub fn publish(&self, index: Arc<EntryIndex>) {
        if self.pending.send(index).is_err() {
            tracing::warn!("Index publisher stopped, dropping update");
        }
    }

    /// Subscribe to the debounced index.
    pub fn subscribe(&self) -> watch::Receiver<Arc<EntryIndex>> {
        self.published.clone()
    }

    /// The most recently published value.
    pub fn latest(&self) -> Arc<EntryIndex> {
        Arc::clone(&self.published.borrow())
    }
}

impl Drop for IndexPublisher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn debounce_loop(
    mut rx: mpsc::UnboundedReceiver<Arc<EntryIndex>>,
    tx: watch::Sender<Arc<EntryIndex>>,
    delay: Duration,
) {
    while let Some(mut latest) = rx.recv().await {
        loop {
            match tokio::time::timeout(delay, rx.recv()).await {
                Ok(Some(next)) => latest = next,
                Ok(None) => {
                    tx.send_replace(latest);
                    return;
                }
                Err(_) => break,
            }
        }
        tracing::trace!("Publishing index with {} entries", latest.len());
        tx.send_replace(latest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::entry::{DirectoryEntry, Entry};
    use crate::store::MemoryStore;

    fn index_with(paths: &[&str]) -> Arc<EntryIndex> {
        let store = MemoryStore::new("root");
        Arc::new(
            paths
                .iter()
                .map(|path| Entry::Directory(DirectoryEntry::new(path.to_string(), store.root(), false)))
                .collect(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_last_value() {
        let publisher = IndexPublisher::new(Duration::from_millis(100));
        let mut rx = publisher.subscribe();

        publisher.publish(index_with(&["root"]));
        publisher.publish(index_with(&["root", "root/a"]));
        publisher.publish(index_with(&["root", "root/a", "root/b"]));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!rx.has_changed().unwrap());

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 3);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_updates_are_each_published() {
        let publisher = IndexPublisher::new(Duration::from_millis(100));
        let mut rx = publisher.subscribe();

        publisher.publish(index_with(&["root"]));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);

        publisher.publish(index_with(&["root", "root/a"]));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 2);
        assert_eq!(publisher.latest().len(), 2);
    }
}
