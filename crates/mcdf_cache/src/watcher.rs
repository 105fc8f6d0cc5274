//! Change detection for the cache folders.
//!
//! A `notify` watcher observes the cache folder (flat) and the content folder
//! (recursive). Relevant paths are pushed into a [`RescanDebouncer`], which
//! coalesces bursts of events and hands the accumulated set to a
//! [`RescanSink`] once the debounce window passes without new events.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::store::{ExtensionFilter, FileCacheStore};

/// Receives the coalesced set of changed paths.
#[async_trait]
pub trait RescanSink: Send + Sync + 'static {
    async fn rescan(&self, paths: Vec<Utf8PathBuf>, cancel: &CancellationToken);
}

#[async_trait]
impl RescanSink for FileCacheStore {
    async fn rescan(&self, paths: Vec<Utf8PathBuf>, cancel: &CancellationToken) {
        match self.rescan_paths(paths, cancel).await {
            Ok(outcome) => tracing::debug!(
                added = outcome.added.len(),
                removed = outcome.removed.len(),
                "Change-triggered rescan finished"
            ),
            Err(Error::Cancelled) => tracing::debug!("Change-triggered rescan cancelled"),
            Err(e) => tracing::warn!(error = %e, "Change-triggered rescan failed"),
        }
    }
}

/// Coalesces change notifications into debounced rescans.
///
/// The first path opens the window, every further path restarts it. When the
/// window elapses the sink is called once with all accumulated paths. Paths
/// arriving while the sink runs are queued and flushed by the next window.
pub struct RescanDebouncer {
    tx: mpsc::UnboundedSender<Utf8PathBuf>,
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl RescanDebouncer {
    /// Spawn the debouncer on the current tokio runtime.
    pub fn spawn(window: Duration, sink: Arc<dyn RescanSink>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_debouncer(rx, window, sink, cancel.clone()));
        Self { tx, task, cancel }
    }

    pub fn notify(&self, path: impl Into<Utf8PathBuf>) {
        // The task only goes away on shutdown.
        let _ = self.tx.send(path.into());
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Utf8PathBuf> {
        self.tx.clone()
    }

    /// Stop the debouncer. Pending paths are dropped; a running rescan sees the cancellation.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run_debouncer(
    mut rx: mpsc::UnboundedReceiver<Utf8PathBuf>,
    window: Duration,
    sink: Arc<dyn RescanSink>,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => return,
            path = rx.recv() => match path {
                Some(path) => path,
                None => return,
            },
        };

        let mut pending = BTreeSet::from([first]);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                path = rx.recv() => match path {
                    Some(path) => {
                        pending.insert(path);
                    }
                    None => break,
                },
                _ = tokio::time::sleep(window) => break,
            }
        }

        tracing::debug!(paths = pending.len(), "Debounce window elapsed, rescanning");
        sink.rescan(pending.into_iter().collect(), &cancel).await;
    }
}

/// Decides which filesystem paths are relevant to the cache.
#[derive(Debug, Clone)]
struct WatchScope {
    cache_folder: Utf8PathBuf,
    content_folder: Option<Utf8PathBuf>,
    filter: ExtensionFilter,
    index_file: Utf8PathBuf,
}

impl WatchScope {
    fn from_config(config: &CacheConfig) -> Self {
        Self {
            cache_folder: config.cache_folder.clone(),
            content_folder: config.content_folder.clone(),
            filter: ExtensionFilter::new(&config.extensions),
            index_file: config.index_file.clone(),
        }
    }

    fn accepts(&self, path: &Utf8Path) -> bool {
        if path == self.index_file
            || path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("tmp"))
        {
            return false;
        }
        if path.parent() == Some(self.cache_folder.as_path()) {
            return true;
        }
        match &self.content_folder {
            Some(content) => path.starts_with(content) && self.filter.matches(path),
            None => false,
        }
    }
}

fn is_change(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Watches the cache and content folders and feeds a [`RescanDebouncer`].
pub struct CacheWatcher {
    _watcher: RecommendedWatcher,
    debouncer: RescanDebouncer,
}

impl CacheWatcher {
    /// Start watching the folders named by `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &CacheConfig,
        sink: Arc<dyn RescanSink>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let debouncer = RescanDebouncer::spawn(config.debounce(), sink, cancel);
        let tx = debouncer.sender();
        let scope = WatchScope::from_config(config);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_change(&event) => {
                    for path in event.paths {
                        let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
                            continue;
                        };
                        if scope.accepts(&path) {
                            let _ = tx.send(path);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "File watcher error"),
            },
            notify::Config::default(),
        )?;

        watcher.watch(config.cache_folder.as_std_path(), RecursiveMode::NonRecursive)?;
        if let Some(content) = &config.content_folder {
            watcher.watch(content.as_std_path(), RecursiveMode::Recursive)?;
        }

        tracing::info!(
            cache = %config.cache_folder,
            content = ?config.content_folder,
            "Watching cache folders"
        );
        Ok(Self {
            _watcher: watcher,
            debouncer,
        })
    }

    /// Queue a path as if the watcher had seen it change.
    pub fn notify(&self, path: impl Into<Utf8PathBuf>) {
        self.debouncer.notify(path);
    }

    pub async fn stop(self) {
        self.debouncer.shutdown().await;
    }
}
