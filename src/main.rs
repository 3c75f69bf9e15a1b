//! Demo application for Scoped Mirror.
//!
//! Mirrors a local directory and prints what every poll cycle finds:
//! 1. The directory is opened through the local store adapter
//! 2. The first levels are loaded into the index
//! 3. The watched directories are polled and diffed
//! 4. Changes are printed via callbacks and the change broadcast

use anyhow::Result;
use scoped_mirror::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn print_paths<V>(label: &str, entries: &HashMap<String, V>) {
    println!("[{}] {} paths", label, entries.len());
    let mut paths: Vec<&String> = entries.keys().collect();
    paths.sort();
    for path in paths.iter().take(5) {
        println!("     - {}", path);
    }
    if paths.len() > 5 {
        println!("     ... and {} more", paths.len() - 5);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("scoped_mirror=debug".parse()?))
        .init();

    println!("=== Scoped Mirror Demo ===\n");

    // Directory to mirror (argument or current directory) and load depth
    let mut args = std::env::args().skip(1);
    let watch_path = match args.next() {
        Some(path) => PathBuf::from(path),
        None => std::env::current_dir()?,
    };
    let depth: usize = match args.next() {
        Some(depth) => depth.parse()?,
        None => 2,
    };

    println!("Mirroring: {} (depth {})\n", watch_path.display(), depth);

    let root = LocalStore::open(&watch_path).await?;

    let mirror = Mirror::builder()
        .load_depth(depth)
        .poll_interval(Duration::from_millis(1000))
        .on_added(Box::new(|added| print_paths("Added", added)))
        .on_deleted(Box::new(|deleted| print_paths("Deleted", deleted)))
        .on_modified(Box::new(|modified| print_paths("Modified", modified)))
        .build();

    let root_entry = mirror.open_root(root, AccessMode::Read).await?;
    let index = mirror.index().await;
    println!("Loaded {}: {}\n", root_entry.path(), index.debug_summary());

    mirror.start_watching();

    println!("Press Ctrl+C to exit\n");
    println!("Try creating, modifying, or deleting files in the mirrored directory.\n");
    println!("---\n");

    let mut changes = mirror.subscribe_changes();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                println!("\nShutting down...");
                break;
            }
            received = changes.recv() => match received {
                Ok(change_set) => {
                    let index = mirror.index().await;
                    println!("[Mirror] {} changes, {}\n", change_set.len(), index.debug_summary());
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} change sets", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    // Cleanup
    mirror.stop_watching().await;
    mirror.close_root().await;
    println!("Done!");

    Ok(())
}
