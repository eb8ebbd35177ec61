//! # Jupiter Bridge
//!
//! Plugin runtime core of the Jupiter host.
//!
//! The bridge discovers units (core, system and tool extensions), validates
//! their manifests, verifies signatures, applies governance, resolves
//! dependencies into load batches and drives every unit through its
//! lifecycle. Loaded units reach host services only through a
//! capability-scoped [`ServiceLocator`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use jupiter_bridge::{Bridge, BridgeConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let bridge = Bridge::from_config(BridgeConfig::load()?)?;
//! let report = bridge.start().await?;
//! println!("{} units ready", report.loaded.len());
//! bridge.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::redundant_else)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unnecessary_map_or)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::future_not_send)]

pub mod bridge;
pub mod config;
pub mod context;
pub mod contributions;
pub mod error;
pub mod events;
pub mod governance;
pub mod hot_reload;
pub mod jobs;
pub mod locator;
pub mod manifest;
pub mod monitoring;
pub mod permissions;
pub mod plugin;
pub mod registry;
pub mod resolver;
pub mod trust;
pub mod types;

// Re-export commonly used types
pub use bridge::{
    Bridge, DiscoveryReport, RestartOrigin, ShutdownReport, StartupReport, FORCED_SHUTDOWN_REASON, GOVERNANCE_REASON,
    SHUTDOWN_REASON,
};
pub use config::BridgeConfig;
pub use context::{BridgeContext, BridgeContextBuilder};
pub use contributions::{ContributionRegistry, DispatchTarget};
pub use error::{BridgeError, BridgeResult};
pub use events::{Event, EventBus, EventPropagator};
pub use governance::{GovernanceManager, GovernanceMode};
pub use hot_reload::{HotReloadController, ReloadRecord};
pub use jobs::{Job, JobContext, JobManager, JobStatus};
pub use locator::{CommandRunner, HistoryProvider, ServiceLocator};
pub use manifest::{Manifest, ManifestLoader};
pub use permissions::Permission;
pub use plugin::{Plugin, PluginCatalog, PluginFactory};
pub use registry::{PluginRecord, RecordFilter};
pub use resolver::{DependencyResolver, LoadPlan};
pub use trust::{TrustLevel, TrustPolicy, TrustStore};
pub use types::{HealthSnapshot, HealthStatus, PluginState, UnitType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The host version manifests are checked against by default.
pub fn host_version() -> semver::Version {
    semver::Version::parse(types::HOST_VERSION).unwrap_or_else(|_| semver::Version::new(1, 4, 0))
}
