//! Applying archives and appearance payloads to live targets.
//!
//! [`ApplyOrchestrator`] runs at most [`ApplyConfig::max_concurrent_applies`]
//! pipelines at once and at most one per target. Each successful application
//! leaves a [`PendingApplication`] holding the [`RevertAction`] that undoes it;
//! applying again to the same target reverts the previous application first.
//!
//! A pipeline moves its target through [`ApplyPhase`]s:
//!
//! ```text
//! Idle -> Staged -> Applied -> (revert) -> Idle
//! Idle -> Staged -> Failed  -> (cleanup) -> Idle
//! ```
//!
//! Every transition is published on the [`MessageBus`].

use camino::Utf8PathBuf;
use mcdf_format::ArchiveDescriptor;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::appearance::derive_payload;
use crate::bus::{Message, MessageBus};
use crate::config::ApplyConfig;
use crate::error::{Error, Result};
use crate::loader::{ArchiveLoader, LoadedArchive, StagedFiles};
use crate::services::{ApplyFlags, BodyScaleId, CollectionId, ServiceSet};
use crate::target::{ApplicationKind, TargetId, TargetRef};

/// Body-scale payload applied when an archive carries none: base64 of `{}`.
pub const EMPTY_BODY_SCALE: &str = "e30=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ApplyPhase {
    #[default]
    Idle,
    Staged,
    Applied,
    Failed,
}

/// What an apply request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyRequest {
    /// Path to a `.mcdf` archive.
    Archive(Utf8PathBuf),
    /// A standalone appearance payload.
    Payload(String),
}

impl ApplyRequest {
    /// Inputs ending in `.mcdf` (any case) are archives, everything else is a payload.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if mcdf_format::has_archive_extension(trimmed) {
            ApplyRequest::Archive(Utf8PathBuf::from(trimmed))
        } else {
            ApplyRequest::Payload(input.to_string())
        }
    }
}

/// Undoes one application. Built up step by step while the pipeline runs so a
/// failure half way can undo exactly what was done.
#[derive(Debug)]
pub struct RevertAction {
    target: TargetRef,
    collection: Option<CollectionId>,
    original_appearance: Option<String>,
    appearance_applied: bool,
    body_scale_applied: bool,
    body_scale_id: Option<BodyScaleId>,
    title_set: bool,
    staged: Option<StagedFiles>,
}

impl RevertAction {
    fn new(target: TargetRef) -> Self {
        Self {
            target,
            collection: None,
            original_appearance: None,
            appearance_applied: false,
            body_scale_applied: false,
            body_scale_id: None,
            title_set: false,
            staged: None,
        }
    }

    /// Whether the pipeline changed anything that would need undoing.
    fn is_noop(&self) -> bool {
        self.collection.is_none()
            && self.staged.is_none()
            && !self.appearance_applied
            && !self.body_scale_applied
            && !self.title_set
    }

    /// Undo in reverse order: collection, appearance, body scale, title, a
    /// redraw, then the staged files. Every step runs even if earlier ones fail.
    pub async fn invoke(self, services: &ServiceSet, config: &ApplyConfig, bus: &MessageBus) {
        let target = &self.target;
        let timeout = config.staging_timeout();
        tracing::debug!(%target, "Running revert action");

        if let (Some(collection), Some(mods)) = (&self.collection, &services.mods) {
            best_effort("remove collection", timeout, mods.remove_collection(collection)).await;
        }

        if self.appearance_applied {
            if let Some(appearance) = &services.appearance {
                best_effort(
                    "revert appearance",
                    timeout,
                    appearance.revert_appearance(target, config.lock_code),
                )
                .await;
                if let Some(original) = self.original_appearance.as_deref().filter(|p| !p.is_empty()) {
                    best_effort(
                        "restore appearance",
                        timeout,
                        appearance.apply_appearance(target, original, 0, ApplyFlags::ALL),
                    )
                    .await;
                }
            }
        }

        if self.body_scale_applied {
            if let Some(body_scale) = &services.body_scale {
                best_effort(
                    "revert body scale",
                    timeout,
                    body_scale.revert_body_scale(target, self.body_scale_id.as_ref()),
                )
                .await;
            }
        }

        if self.title_set {
            if let Some(title) = &services.title {
                best_effort("clear title", timeout, title.clear_title(target)).await;
            }
        }

        if self.collection.is_some() || self.appearance_applied {
            if let Some(redraw) = &services.redraw {
                bus.publish(Message::RedrawStarted {
                    target: target.clone(),
                });
                best_effort("redraw", timeout, redraw.trigger_redraw(target)).await;
                best_effort(
                    "draw completion",
                    config.draw_timeout(),
                    redraw.wait_for_draw_completion(target, config.draw_timeout()),
                )
                .await;
                bus.publish(Message::RedrawFinished {
                    target: target.clone(),
                });
            }
        }

        if let Some(staged) = &self.staged {
            staged.remove_all();
        }
        tracing::info!(%target, "Reverted application");
    }
}

/// An application currently in effect on a target.
#[derive(Debug)]
pub struct PendingApplication {
    pub target: TargetRef,
    pub kind: ApplicationKind,
    revert: RevertAction,
}

#[derive(Clone, Copy)]
enum Source<'a> {
    Archive(&'a LoadedArchive),
    Payload(&'a str),
}

impl<'a> Source<'a> {
    fn descriptor(&self) -> Option<&'a ArchiveDescriptor> {
        match *self {
            Source::Archive(archive) => Some(&archive.descriptor),
            Source::Payload(_) => None,
        }
    }

    fn appearance_payload(&self) -> &'a str {
        match *self {
            Source::Archive(archive) => &archive.descriptor.appearance_payload,
            Source::Payload(payload) => payload,
        }
    }
}

/// Counts a pipeline as in flight for as long as it lives.
struct WorkingGuard<'a>(&'a AtomicUsize);

impl<'a> WorkingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WorkingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ApplyOrchestrator {
    services: ServiceSet,
    loader: ArchiveLoader,
    bus: MessageBus,
    config: ApplyConfig,
    shutdown: CancellationToken,
    permits: Semaphore,
    pending: tokio::sync::Mutex<HashMap<TargetId, PendingApplication>>,
    target_locks: std::sync::Mutex<HashMap<TargetId, Arc<tokio::sync::Mutex<()>>>>,
    phases: std::sync::Mutex<HashMap<TargetId, ApplyPhase>>,
    in_flight: AtomicUsize,
}

impl ApplyOrchestrator {
    pub fn new(
        services: ServiceSet,
        loader: ArchiveLoader,
        bus: MessageBus,
        config: ApplyConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let permits = Semaphore::new(config.permits());
        Self {
            services,
            loader,
            bus,
            config,
            shutdown,
            permits,
            pending: tokio::sync::Mutex::new(HashMap::new()),
            target_locks: std::sync::Mutex::new(HashMap::new()),
            phases: std::sync::Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn services(&self) -> &ServiceSet {
        &self.services
    }

    pub fn loader(&self) -> &ArchiveLoader {
        &self.loader
    }

    /// Whether any apply pipeline is queued or running.
    pub fn is_working(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn phase(&self, target: TargetId) -> ApplyPhase {
        self.phases
            .lock()
            .map(|phases| phases.get(&target).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Targets that currently have an application in effect.
    pub async fn handled_targets(&self) -> Vec<TargetRef> {
        let pending = self.pending.lock().await;
        let mut targets: Vec<TargetRef> = pending.values().map(|p| p.target.clone()).collect();
        targets.sort_by_key(|t| t.id);
        targets
    }

    pub async fn pending_kind(&self, target: TargetId) -> Option<ApplicationKind> {
        self.pending.lock().await.get(&target).map(|p| p.kind)
    }

    /// Route a raw request string to [`Self::apply_archive`] or [`Self::apply_standalone_payload`].
    pub async fn apply_request(
        &self,
        target: &TargetRef,
        input: &str,
        kind: ApplicationKind,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match ApplyRequest::parse(input) {
            ApplyRequest::Archive(path) => {
                let archive = match self.loader.read_header_async(path.clone()).await {
                    Ok(archive) => archive,
                    Err(e) => {
                        tracing::error!(%path, error = %e, "Could not read archive");
                        self.bus.publish(Message::error(
                            format!("Could not read {path}"),
                            e.to_string(),
                        ));
                        return Err(e);
                    }
                };
                self.apply_archive(target, &archive, kind, cancel).await
            }
            ApplyRequest::Payload(payload) => {
                self.apply_standalone_payload(target, &payload, kind, cancel)
                    .await
            }
        }
    }

    /// Extract `archive` and apply it to `target`.
    pub async fn apply_archive(
        &self,
        target: &TargetRef,
        archive: &LoadedArchive,
        kind: ApplicationKind,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run(target, kind, Source::Archive(archive), cancel)
            .await
    }

    /// Apply an appearance payload without any archive content.
    pub async fn apply_standalone_payload(
        &self,
        target: &TargetRef,
        payload: &str,
        kind: ApplicationKind,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run(target, kind, Source::Payload(payload), cancel)
            .await
    }

    /// Revert the application on `target`, if any. Returns whether one was reverted.
    pub async fn revert(&self, target: TargetId) -> Result<bool> {
        let lock = self.target_lock(target)?;
        let _guard = lock.lock().await;

        let Some(pending) = self.pending.lock().await.remove(&target) else {
            tracing::debug!(%target, "Nothing to revert");
            return Ok(false);
        };

        let target_ref = pending.target.clone();
        pending
            .revert
            .invoke(&self.services, &self.config, &self.bus)
            .await;
        self.set_phase(&target_ref, ApplyPhase::Idle);
        Ok(true)
    }

    /// Revert every pending application, one target after another.
    ///
    /// Each entry is taken out of the pending map only while its target lock
    /// is held, so an apply racing this call either finishes first and gets
    /// reverted here, or starts afterwards from the restored state.
    pub async fn remove_all(&self) -> Result<usize> {
        let mut targets: Vec<TargetId> = self.pending.lock().await.keys().copied().collect();
        targets.sort();
        tracing::info!(count = targets.len(), "Reverting all applications");

        let mut count = 0;
        for target in targets {
            if count > 0 {
                tokio::time::sleep(self.config.revert_delay()).await;
            }
            if self.revert(target).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    fn target_lock(&self, target: TargetId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self.target_locks.lock()?;
        Ok(Arc::clone(locks.entry(target).or_default()))
    }

    fn set_phase(&self, target: &TargetRef, phase: ApplyPhase) {
        match self.phases.lock() {
            Ok(mut phases) => {
                phases.insert(target.id, phase);
            }
            Err(_) => tracing::warn!(%target, "Phase map lock poisoned"),
        }
        tracing::debug!(%target, ?phase, "Phase changed");
        self.bus.publish(Message::PhaseChanged {
            target: target.clone(),
            phase,
        });
    }

    async fn run(
        &self,
        target: &TargetRef,
        kind: ApplicationKind,
        source: Source<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _working = WorkingGuard::new(&self.in_flight);
        let token = self.shutdown.child_token();
        let _link = link_cancellation(cancel, &token);

        // Requests queued behind the same target must not hold a permit.
        let target_lock = self.target_lock(target.id)?;
        let _target_guard = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            guard = target_lock.lock() => guard,
        };
        let _permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| Error::Cancelled)?,
        };

        let apply_id = Uuid::new_v4();
        tracing::info!(%apply_id, %target, ?kind, "Starting application");

        let previous = self.pending.lock().await.remove(&target.id);
        let mut revert = RevertAction::new(target.clone());
        if let Some(previous) = previous {
            tracing::info!(%apply_id, %target, "Reverting previous application first");
            revert.original_appearance = previous.revert.original_appearance.clone();
            previous
                .revert
                .invoke(&self.services, &self.config, &self.bus)
                .await;
            self.set_phase(target, ApplyPhase::Idle);
        }

        let result = self
            .pipeline(apply_id, target, kind, source, &mut revert, &token)
            .await;

        match result {
            Ok(()) if revert.is_noop() => {
                tracing::info!(%apply_id, %target, ?kind, "Nothing to apply for this kind");
                self.set_phase(target, ApplyPhase::Idle);
                Ok(())
            }
            Ok(()) => {
                let mut pending = self.pending.lock().await;
                if pending.contains_key(&target.id) {
                    drop(pending);
                    tracing::error!(%apply_id, %target, "Another application was registered meanwhile");
                    revert.invoke(&self.services, &self.config, &self.bus).await;
                    return Err(Error::ConcurrencyViolation(target.to_string()));
                }
                pending.insert(
                    target.id,
                    PendingApplication {
                        target: target.clone(),
                        kind,
                        revert,
                    },
                );
                drop(pending);
                self.set_phase(target, ApplyPhase::Applied);
                tracing::info!(%apply_id, %target, "Application complete");
                Ok(())
            }
            Err(e) => {
                tracing::error!(%apply_id, %target, error = %e, "Application failed, cleaning up");
                self.set_phase(target, ApplyPhase::Failed);
                revert.invoke(&self.services, &self.config, &self.bus).await;
                self.bus.publish(Message::error(
                    format!("Failed to apply to {}", target.name),
                    e.to_string(),
                ));
                self.set_phase(target, ApplyPhase::Idle);
                Err(e)
            }
        }
    }

    async fn pipeline(
        &self,
        apply_id: Uuid,
        target: &TargetRef,
        kind: ApplicationKind,
        source: Source<'_>,
        revert: &mut RevertAction,
        token: &CancellationToken,
    ) -> Result<()> {
        let timeout = self.config.staging_timeout();
        let descriptor = source.descriptor();

        let appearance = match (&self.services.appearance, kind.applies_appearance()) {
            (Some(service), true) => Some(service),
            (None, true) if kind == ApplicationKind::OnlyGlamourerData || descriptor.is_none() => {
                return Err(Error::ServiceUnavailable("appearance"));
            }
            (None, true) => {
                tracing::warn!(%apply_id, "Appearance service unavailable, skipping appearance");
                None
            }
            _ => None,
        };

        let mods = match (descriptor, &self.services.mods, kind.applies_mods()) {
            (Some(_), Some(service), true) => Some(service),
            (Some(_), None, true) if kind == ApplicationKind::OnlyModData => {
                return Err(Error::ServiceUnavailable("mod"));
            }
            (Some(_), None, true) => {
                tracing::warn!(%apply_id, "Mod service unavailable, skipping mod files");
                None
            }
            _ => None,
        };

        if kind == ApplicationKind::OnlyCustomizeData && self.services.body_scale.is_none() {
            return Err(Error::ServiceUnavailable("body scale"));
        }

        // Snapshot the current appearance once per pending chain.
        if let Some(service) = appearance.filter(|_| revert.original_appearance.is_none()) {
            revert.original_appearance =
                step("appearance snapshot", timeout, token, service.get_appearance(target)).await?;
        }

        if let (Some(service), Source::Archive(archive)) = (mods, source) {
            // Extraction watches the token itself and cleans up after a failure,
            // so it is awaited to completion rather than raced.
            let staged = self
                .loader
                .extract_async(archive.clone(), target.staging_owner(), token.clone())
                .await?;

            let mut mappings: BTreeMap<String, String> = archive.descriptor.swap_mappings();
            for (game_path, file) in &staged.mappings {
                mappings.insert(game_path.clone(), file.to_string());
            }
            revert.staged = Some(staged);
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let name = format!("mcdf_{}_{}", target.staging_owner(), apply_id.simple());
            let collection = step(
                "create collection",
                timeout,
                token,
                service.create_temporary_collection(&name),
            )
            .await?;
            revert.collection = Some(collection.clone());
            tracing::debug!(%apply_id, %collection, mappings = mappings.len(), "Staging mod files");

            step(
                "assign collection",
                timeout,
                token,
                service.assign_collection(&collection, target),
            )
            .await?;
            step(
                "file mappings",
                timeout,
                token,
                service.set_file_mappings(&collection, &mappings),
            )
            .await?;
            step(
                "manipulation data",
                timeout,
                token,
                service.set_manipulation_data(&collection, &archive.descriptor.manipulation_data),
            )
            .await?;
        }
        self.set_phase(target, ApplyPhase::Staged);

        let incoming = source.appearance_payload();
        if let Some(service) = appearance.filter(|_| !incoming.is_empty()) {
            let payload = derive_payload(kind, incoming, revert.original_appearance.as_deref());
            revert.appearance_applied = true;
            step(
                "apply appearance",
                timeout,
                token,
                service.apply_appearance(target, &payload, self.config.lock_code, ApplyFlags::ALL),
            )
            .await?;
        }

        if revert.collection.is_some() || revert.appearance_applied {
            self.redraw(target, token).await?;
        }

        if let (Some(descriptor), Some(service), true) = (
            descriptor,
            &self.services.body_scale,
            kind.applies_body_scale(),
        ) {
            let payload = descriptor.body_scale_payload().unwrap_or(EMPTY_BODY_SCALE);
            revert.body_scale_applied = true;
            revert.body_scale_id =
                step("body scale", timeout, token, service.set_body_scale(target, payload)).await?;
        }

        if let (Some(title), Some(service), true) = (
            descriptor.and_then(ArchiveDescriptor::title_payload),
            &self.services.title,
            kind.applies_title(),
        ) {
            match step("title", timeout, token, service.set_title(target, title)).await {
                Ok(()) => revert.title_set = true,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => tracing::warn!(%apply_id, error = %e, "Could not set title, continuing"),
            }
        }

        Ok(())
    }

    async fn redraw(&self, target: &TargetRef, token: &CancellationToken) -> Result<()> {
        let Some(redraw) = &self.services.redraw else {
            tracing::debug!(%target, "No redraw service, skipping redraw");
            return Ok(());
        };

        self.bus.publish(Message::RedrawStarted {
            target: target.clone(),
        });
        let draw_timeout = self.config.draw_timeout();
        let result = async {
            step(
                "redraw",
                self.config.staging_timeout(),
                token,
                redraw.trigger_redraw(target),
            )
            .await?;
            step(
                "draw completion",
                draw_timeout,
                token,
                redraw.wait_for_draw_completion(target, draw_timeout),
            )
            .await
        }
        .await;
        self.bus.publish(Message::RedrawFinished {
            target: target.clone(),
        });
        result
    }
}

/// Cancel `child` when `parent` is cancelled. The returned guard cancels
/// `child` on drop, which also ends the forwarding task.
fn link_cancellation(parent: &CancellationToken, child: &CancellationToken) -> DropGuard {
    if parent.is_cancelled() {
        child.cancel();
    } else {
        let parent = parent.clone();
        let linked = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
    }
    child.clone().drop_guard()
}

/// Run one pipeline step, racing cancellation and a timeout.
async fn step<T>(
    name: &'static str,
    timeout: Duration,
    token: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(result) => result,
            Err(_) => Err(Error::TimedOut { step: name, after: timeout }),
        },
    }
}

/// Run a cleanup step; failures are logged and swallowed.
async fn best_effort(name: &'static str, timeout: Duration, fut: impl Future<Output = Result<()>>) {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(())) => tracing::trace!(step = name, "Revert step done"),
        Ok(Err(e)) => tracing::warn!(step = name, error = %e, "Revert step failed"),
        Err(_) => tracing::warn!(step = name, ?timeout, "Revert step timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_discrimination() {
        assert_eq!(
            ApplyRequest::parse("C:/exports/look.MCDF"),
            ApplyRequest::Archive(Utf8PathBuf::from("C:/exports/look.MCDF"))
        );
        assert_eq!(
            ApplyRequest::parse("  /tmp/a.mcdf \n"),
            ApplyRequest::Archive(Utf8PathBuf::from("/tmp/a.mcdf"))
        );
        assert_eq!(
            ApplyRequest::parse("H4sIAAAAAAAACu2Y"),
            ApplyRequest::Payload("H4sIAAAAAAAACu2Y".to_string())
        );
        assert!(matches!(ApplyRequest::parse("a.mcdf.txt"), ApplyRequest::Payload(_)));
    }

    #[tokio::test]
    async fn test_step_times_out() {
        let token = CancellationToken::new();
        let err = step("slow", Duration::from_millis(20), &token, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TimedOut { step: "slow", .. }));
    }

    #[tokio::test]
    async fn test_step_observes_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let err = step("any", Duration::from_secs(5), &token, async { Ok(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_link_cancellation_forwards() {
        let parent = CancellationToken::new();
        let child = CancellationToken::new();
        let guard = link_cancellation(&parent, &child);
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .unwrap();
        drop(guard);
    }
}
