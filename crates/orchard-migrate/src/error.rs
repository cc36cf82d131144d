//! Migration error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use orchard_core::TenantId;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("recipe '{recipe}' failed for tenant '{tenant}': {reason}")]
    Execution {
        tenant: TenantId,
        recipe: String,
        reason: String,
    },

    #[error("recipe not found: {0}")]
    RecipeNotFound(String),

    #[error("failed to read recipe {path:?}: {source}")]
    RecipeRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("gave up after {waited:?} waiting for {what}")]
    Busy { what: String, waited: Duration },

    #[error("tenant lock file {path:?}: {source}")]
    LockFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state store error: {0}")]
    State(#[from] orchard_state::StateError),
}

pub type MigrationResult<T> = Result<T, MigrationError>;
