//! Build, extract and apply chara archives.
//!
//! - [`ArchiveBuilder`] turns a [`CharacterSnapshot`] into a `.mcdf` archive,
//!   resolving replaced files through the content cache.
//! - [`ArchiveLoader`] reads archive headers and extracts bodies into staging files.
//! - [`ApplyOrchestrator`] pushes an archive or payload through the external
//!   services and keeps the revert action of every application.
//! - [`McdfContext`] wires all of it together for a host.

pub mod appearance;
pub mod builder;
pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod loader;
pub mod logging;
pub mod orchestrator;
pub mod services;
pub mod snapshot;
pub mod target;

pub use builder::ArchiveBuilder;
pub use bus::{Message, MessageBus, MessageKind, Severity, Subscription};
pub use config::{ApplyConfig, LoaderConfig};
pub use context::McdfContext;
pub use error::{Error, Result};
pub use loader::{ArchiveLoader, LoadedArchive, StagedFiles};
pub use orchestrator::{ApplyOrchestrator, ApplyPhase, ApplyRequest, PendingApplication, RevertAction};
pub use services::{
    AppearanceService, ApplyFlags, BodyScaleId, BodyScaleService, CollectionId, ModService,
    RedrawService, ServiceSet, ServiceVersion, TitleService,
};
pub use snapshot::{CharacterSnapshot, FileReplacement};
pub use target::{ApplicationKind, TargetId, TargetRef};

#[cfg(test)]
mod tests;
