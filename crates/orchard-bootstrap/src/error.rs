//! Bootstrap error types.

use thiserror::Error;

/// Errors that stop an orchestration run or an application launch.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("duplicate resource: {0}")]
    DuplicateNode(String),

    #[error("resource '{node}' depends on unknown resource '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("unknown resource: {0}")]
    UnknownNode(String),

    #[error("resource '{node}' failed because dependency '{dependency}' failed")]
    DependencyFailed { node: String, dependency: String },

    #[error("resource '{node}' did not become ready in time")]
    TimedOut { node: String },

    #[error("resource '{node}' failed readiness: {reason}")]
    ReadinessFailed { node: String, reason: String },

    #[error("cannot start '{action}': missing bindings {}", missing.join(", "))]
    IncompleteBindings { action: String, missing: Vec<String> },

    #[error("resource '{0}' is not ready; its bindings cannot be resolved yet")]
    NotReady(String),

    #[error("binding '{key}' was already produced with a different value")]
    BindingConflict { key: String },

    #[error("orchestration cancelled")]
    Cancelled,

    #[error("failed to mint credentials: {0}")]
    Credentials(String),

    #[error("state store error: {0}")]
    State(#[from] orchard_state::StateError),

    #[error("failed to launch application: {0}")]
    Launch(#[source] std::io::Error),
}

pub type BootstrapResult<T> = Result<T, BootstrapError>;
