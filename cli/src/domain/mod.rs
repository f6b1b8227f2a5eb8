//! Domain layer: pure business logic, types, and validation.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All functions are synchronous and take data in, returning data out.

pub mod approval;
pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod error;
pub mod manifest;
pub mod planner;
pub mod retry;
pub mod run;
pub mod verify;
pub mod workload;

pub use config::{KeelConfig, apply_config_value, validate_config_key, validate_config_value};
pub use error::{ConfigError, CycleError, DeployError, ManifestError, ProviderError, error_code};
pub use manifest::{DeploymentManifest, parse_manifest};
pub use retry::{PollPolicy, RetryPolicy};
pub use run::DeploymentRun;
