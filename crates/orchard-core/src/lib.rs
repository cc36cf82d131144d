//! orchard-core — resource declarations and host configuration.
//!
//! The host configuration (`orchard.toml`) is the resource descriptor
//! registry: every backing resource is declared once as a named node with a
//! kind, a lifetime policy and its dependencies. The whole declaration is
//! parsed into a [`HostConfig`] and validated in one step before anything
//! is started.

pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use config::{
    AppConfig, BootstrapConfig, EnvSource, HostConfig, MigrationsConfig, ResourceDecl,
    StartupAction, TenantConfig,
};
pub use duration::parse_duration;
pub use error::ConfigError;
pub use types::*;
