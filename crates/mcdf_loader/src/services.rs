//! Capability traits for the external services an archive is applied through.
//!
//! Every service is optional. [`ServiceSet::probe`] asks each one for its
//! version and drops those that fail or are too old, so a missing service only
//! disables the features that need it.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::target::TargetRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceVersion {
    pub major: u32,
    pub minor: u32,
}

impl ServiceVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

pub const MIN_APPEARANCE_VERSION: ServiceVersion = ServiceVersion::new(1, 1);
pub const MIN_MOD_VERSION: ServiceVersion = ServiceVersion::new(5, 0);
pub const MIN_BODY_SCALE_VERSION: ServiceVersion = ServiceVersion::new(2, 0);
pub const MIN_TITLE_VERSION: ServiceVersion = ServiceVersion::new(3, 1);

/// Which parts of an appearance payload the appearance service applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyFlags {
    pub customization: bool,
    pub equipment: bool,
}

impl ApplyFlags {
    pub const ALL: Self = Self {
        customization: true,
        equipment: true,
    };
}

/// Handle of a temporary mod collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionId(pub String);

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registration handle returned when a body scale is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BodyScaleId(pub String);

#[async_trait]
pub trait AppearanceService: Send + Sync {
    async fn query_version(&self) -> Result<ServiceVersion>;
    /// Current appearance payload of the target, if it has one.
    async fn get_appearance(&self, target: &TargetRef) -> Result<Option<String>>;
    async fn apply_appearance(
        &self,
        target: &TargetRef,
        payload: &str,
        lock: u32,
        flags: ApplyFlags,
    ) -> Result<()>;
    async fn revert_appearance(&self, target: &TargetRef, lock: u32) -> Result<()>;
}

#[async_trait]
pub trait ModService: Send + Sync {
    async fn query_version(&self) -> Result<ServiceVersion>;
    async fn create_temporary_collection(&self, name: &str) -> Result<CollectionId>;
    async fn assign_collection(&self, collection: &CollectionId, target: &TargetRef) -> Result<()>;
    /// Game path to source file (staged file or swap target).
    async fn set_file_mappings(
        &self,
        collection: &CollectionId,
        mappings: &BTreeMap<String, String>,
    ) -> Result<()>;
    async fn set_manipulation_data(&self, collection: &CollectionId, data: &[u8]) -> Result<()>;
    async fn remove_collection(&self, collection: &CollectionId) -> Result<()>;
}

#[async_trait]
pub trait BodyScaleService: Send + Sync {
    async fn query_version(&self) -> Result<ServiceVersion>;
    async fn set_body_scale(&self, target: &TargetRef, payload: &str) -> Result<Option<BodyScaleId>>;
    async fn revert_body_scale(&self, target: &TargetRef, id: Option<&BodyScaleId>) -> Result<()>;
}

#[async_trait]
pub trait RedrawService: Send + Sync {
    async fn trigger_redraw(&self, target: &TargetRef) -> Result<()>;
    /// Resolve once the target finished drawing, or fail after `timeout`.
    async fn wait_for_draw_completion(&self, target: &TargetRef, timeout: Duration) -> Result<()>;
}

#[async_trait]
pub trait TitleService: Send + Sync {
    async fn query_version(&self) -> Result<ServiceVersion>;
    async fn set_title(&self, target: &TargetRef, payload: &str) -> Result<()>;
    async fn clear_title(&self, target: &TargetRef) -> Result<()>;
}

/// The services available to the orchestrator.
#[derive(Clone, Default)]
pub struct ServiceSet {
    pub appearance: Option<Arc<dyn AppearanceService>>,
    pub mods: Option<Arc<dyn ModService>>,
    pub body_scale: Option<Arc<dyn BodyScaleService>>,
    pub redraw: Option<Arc<dyn RedrawService>>,
    pub title: Option<Arc<dyn TitleService>>,
}

impl fmt::Debug for ServiceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSet")
            .field("appearance", &self.appearance.is_some())
            .field("mods", &self.mods.is_some())
            .field("body_scale", &self.body_scale.is_some())
            .field("redraw", &self.redraw.is_some())
            .field("title", &self.title.is_some())
            .finish()
    }
}

async fn version_ok(
    name: &'static str,
    minimum: ServiceVersion,
    probe: impl std::future::Future<Output = Result<ServiceVersion>>,
) -> bool {
    match probe.await {
        Ok(version) if version >= minimum => {
            tracing::info!(service = name, %version, "Service available");
            true
        }
        Ok(version) => {
            tracing::warn!(service = name, %version, %minimum, "Service too old, disabling");
            false
        }
        Err(e) => {
            tracing::warn!(service = name, error = %e, "Service probe failed, disabling");
            false
        }
    }
}

impl ServiceSet {
    pub fn with_appearance(mut self, service: Arc<dyn AppearanceService>) -> Self {
        self.appearance = Some(service);
        self
    }

    pub fn with_mods(mut self, service: Arc<dyn ModService>) -> Self {
        self.mods = Some(service);
        self
    }

    pub fn with_body_scale(mut self, service: Arc<dyn BodyScaleService>) -> Self {
        self.body_scale = Some(service);
        self
    }

    pub fn with_redraw(mut self, service: Arc<dyn RedrawService>) -> Self {
        self.redraw = Some(service);
        self
    }

    pub fn with_title(mut self, service: Arc<dyn TitleService>) -> Self {
        self.title = Some(service);
        self
    }

    /// Query every versioned service and drop the ones that fail or are too old.
    pub async fn probe(mut self) -> Self {
        if let Some(service) = &self.appearance {
            if !version_ok("appearance", MIN_APPEARANCE_VERSION, service.query_version()).await {
                self.appearance = None;
            }
        }
        if let Some(service) = &self.mods {
            if !version_ok("mod", MIN_MOD_VERSION, service.query_version()).await {
                self.mods = None;
            }
        }
        if let Some(service) = &self.body_scale {
            if !version_ok("body scale", MIN_BODY_SCALE_VERSION, service.query_version()).await {
                self.body_scale = None;
            }
        }
        if let Some(service) = &self.title {
            if !version_ok("title", MIN_TITLE_VERSION, service.query_version()).await {
                self.title = None;
            }
        }
        self
    }
}
