//! Configuration errors.

use thiserror::Error;

use crate::types::ResourceKind;

/// Errors found while parsing or validating `orchard.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("resource #{0} has an empty name")]
    EmptyName(usize),

    #[error("duplicate resource name: {0}")]
    DuplicateResource(String),

    #[error("resources '{first}' and '{second}' share the environment key segment {segment}")]
    EnvKeyCollision {
        first: String,
        second: String,
        segment: String,
    },

    #[error("{node} ({kind}) must depend on exactly one {expected} resource")]
    MissingParent {
        node: String,
        kind: ResourceKind,
        expected: ResourceKind,
    },

    #[error("parameter '{0}' cannot depend on other resources")]
    ParameterWithDependencies(String),

    #[error("{context} references unknown resource '{name}'")]
    UnknownReference { context: String, name: String },

    #[error("invalid duration for {field}: '{value}'")]
    InvalidDuration { field: String, value: String },

    #[error("{0} has an empty command")]
    EmptyCommand(String),

    #[error("duplicate tenant: {0}")]
    DuplicateTenant(String),
}
