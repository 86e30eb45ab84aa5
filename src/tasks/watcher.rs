//! Filesystem watch on the two task files.
//!
//! `notify` delivers events on its own thread; we bridge them onto a tokio
//! channel and have a single task debounce and re-read the affected queue.
//! The store's own writes also trip the watcher; that re-read compares equal
//! and publishes nothing, so the loop is quiet.

use crate::models::Queue;
use crate::tasks::TaskStore;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

pub struct TaskFileWatcher {
    // Dropping the watcher stops the notify thread.
    _watcher: RecommendedWatcher,
    handle: tokio::task::JoinHandle<()>,
}

impl TaskFileWatcher {
    /// Start watching both queue files' parent directories. Watching the
    /// directory rather than the file survives editors that replace the
    /// file by rename.
    pub fn start(store: TaskStore) -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    for path in event.paths {
                        // Unbounded send from the notify thread; the tokio
                        // side drains and coalesces.
                        let _ = tx.send(path);
                    }
                }
                Err(e) => error!(error = %e, "task file watch error"),
            },
            notify::Config::default(),
        )?;

        for queue in [Queue::User, Queue::Internal] {
            let file = store.file_path(queue);
            let dir = file.parent().unwrap_or_else(|| Path::new("."));
            if !dir.exists() {
                std::fs::create_dir_all(dir).ok();
            }
            if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                warn!(path = %dir.display(), error = %e, "could not watch task directory");
            }
        }

        let handle = tokio::spawn(Self::pump(store, rx));
        Ok(Self {
            _watcher: watcher,
            handle,
        })
    }

    async fn pump(store: TaskStore, mut rx: mpsc::UnboundedReceiver<PathBuf>) {
        while let Some(first) = rx.recv().await {
            let mut touched = vec![first];
            // Editors fire bursts (create temp, write, rename); coalesce a
            // short window into one re-read per queue.
            let deadline = tokio::time::sleep(Duration::from_millis(200));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(path) => touched.push(path),
                        None => break,
                    },
                    _ = &mut deadline => break,
                }
            }

            for queue in [Queue::User, Queue::Internal] {
                let watched = store.file_path(queue);
                if touched.iter().any(|p| paths_match(p, watched)) {
                    debug!(queue = %queue, "task file changed on disk");
                    store.refresh(queue).await;
                }
            }
        }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

fn paths_match(event_path: &Path, watched: &Path) -> bool {
    if event_path == watched {
        return true;
    }
    // Watchers report directory-level events with absolute paths while the
    // configured path may be relative; fall back to file-name identity.
    match (event_path.file_name(), watched.file_name()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
