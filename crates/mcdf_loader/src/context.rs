//! Wiring of cache, builder, loader and orchestrator for a host.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use mcdf_cache::{CacheWatcher, FileCacheStore, RescanSink, ScanOutcome};
use mcdf_format::ArchiveDescriptor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::builder::ArchiveBuilder;
use crate::bus::{Message, MessageBus};
use crate::config::LoaderConfig;
use crate::error::Result;
use crate::loader::{ArchiveLoader, LoadedArchive};
use crate::orchestrator::ApplyOrchestrator;
use crate::services::ServiceSet;
use crate::snapshot::CharacterSnapshot;
use crate::target::{ApplicationKind, TargetId, TargetRef};

/// Forwards watcher rescans to the store and reports changes on the bus.
struct BusRescanSink {
    store: Arc<FileCacheStore>,
    bus: MessageBus,
}

#[async_trait]
impl RescanSink for BusRescanSink {
    async fn rescan(&self, paths: Vec<Utf8PathBuf>, cancel: &CancellationToken) {
        match self.store.rescan_paths(paths, cancel).await {
            Ok(outcome) if !outcome.is_empty() => self.bus.publish(Message::CacheRescanned {
                added: outcome.added.len(),
                removed: outcome.removed.len(),
            }),
            Ok(_) => {}
            Err(mcdf_cache::Error::Cancelled) => tracing::debug!("Watcher rescan cancelled"),
            Err(e) => tracing::warn!(error = %e, "Watcher rescan failed"),
        }
    }
}

pub struct McdfContext {
    config: LoaderConfig,
    bus: MessageBus,
    store: Arc<FileCacheStore>,
    builder: ArchiveBuilder,
    orchestrator: Arc<ApplyOrchestrator>,
    shutdown: CancellationToken,
    watcher: Option<CacheWatcher>,
}

impl McdfContext {
    /// Open the cache index and probe `services`. No scan is started.
    pub async fn new(config: LoaderConfig, services: ServiceSet) -> Result<Self> {
        let store = Arc::new(FileCacheStore::open(config.cache.clone())?);
        let services = services.probe().await;
        tracing::info!(?services, entries = store.len(), "Loader context ready");

        let bus = MessageBus::new();
        let shutdown = CancellationToken::new();
        let builder = ArchiveBuilder::new(Arc::clone(&store), config.compression_level);
        let loader = ArchiveLoader::new(config.staging_folder.clone());
        let orchestrator = Arc::new(ApplyOrchestrator::new(
            services,
            loader,
            bus.clone(),
            config.apply.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            config,
            bus,
            store,
            builder,
            orchestrator,
            shutdown,
            watcher: None,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<FileCacheStore> {
        &self.store
    }

    pub fn builder(&self) -> &ArchiveBuilder {
        &self.builder
    }

    pub fn orchestrator(&self) -> &Arc<ApplyOrchestrator> {
        &self.orchestrator
    }

    /// Full cache scan; reports the result on the bus.
    pub async fn scan(&self) -> Result<ScanOutcome> {
        let outcome = self.store.scan_all(&self.shutdown).await?;
        self.bus.publish(Message::CacheRescanned {
            added: outcome.added.len(),
            removed: outcome.removed.len(),
        });
        Ok(outcome)
    }

    /// Start watching the cache folders. Calling it twice is a no-op.
    pub fn start_watcher(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }
        let sink = Arc::new(BusRescanSink {
            store: Arc::clone(&self.store),
            bus: self.bus.clone(),
        });
        self.watcher = Some(CacheWatcher::start(
            &self.config.cache,
            sink,
            self.shutdown.child_token(),
        )?);
        Ok(())
    }

    pub async fn export(
        &self,
        description: &str,
        snapshot: &CharacterSnapshot,
        dest: Utf8PathBuf,
    ) -> Result<ArchiveDescriptor> {
        let result = self.builder.export(description, snapshot, dest.clone()).await;
        match &result {
            Ok(_) => self
                .bus
                .publish(Message::info("Archive saved", dest.to_string())),
            Err(e) => self
                .bus
                .publish(Message::error(format!("Could not save {dest}"), e.to_string())),
        }
        result
    }

    pub async fn load(&self, path: Utf8PathBuf) -> Result<LoadedArchive> {
        self.orchestrator.loader().read_header_async(path).await
    }

    /// Apply an archive path or appearance payload to `target`.
    pub async fn apply(
        &self,
        target: &TargetRef,
        input: &str,
        kind: ApplicationKind,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.orchestrator
            .apply_request(target, input, kind, cancel)
            .await
    }

    pub async fn revert(&self, target: TargetId) -> Result<bool> {
        self.orchestrator.revert(target).await
    }

    /// Cancel in-flight work, stop the watcher and revert every application.
    pub async fn shutdown(mut self) -> Result<usize> {
        tracing::info!("Shutting down loader context");
        self.shutdown.cancel();
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        self.orchestrator.remove_all().await
    }
}
