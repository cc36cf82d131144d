//! Process exit codes.

use std::fmt;
use std::path::{Path, PathBuf};

use orchard_bootstrap::BootstrapError;
use orchard_core::ConfigError;
use orchard_migrate::MigrationError;

pub const FAILURE: u8 = 1;
pub const CONFIG: u8 = 2;
pub const CYCLE_DETECTED: u8 = 10;
pub const DEPENDENCY_FAILED: u8 = 11;
pub const TIMED_OUT: u8 = 12;
pub const INCOMPLETE_BINDINGS: u8 = 13;
pub const READINESS_FAILED: u8 = 14;
pub const MIGRATION_FAILED: u8 = 20;
/// Conventional code for termination by SIGINT.
pub const INTERRUPTED: u8 = 130;

/// Context attached to every configuration loading error.
#[derive(Debug)]
pub struct InvalidConfig(pub PathBuf);

impl InvalidConfig {
    pub fn new(path: &Path) -> Self {
        Self(path.to_path_buf())
    }
}

impl fmt::Display for InvalidConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration {}", self.0.display())
    }
}

/// Map an error to the host's exit code.
pub fn code_for(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<BootstrapError>() {
        return match e {
            BootstrapError::CycleDetected { .. } => CYCLE_DETECTED,
            BootstrapError::DependencyFailed { .. } => DEPENDENCY_FAILED,
            BootstrapError::TimedOut { .. } => TIMED_OUT,
            BootstrapError::IncompleteBindings { .. } => INCOMPLETE_BINDINGS,
            BootstrapError::ReadinessFailed { .. } | BootstrapError::NotReady(_) => {
                READINESS_FAILED
            }
            BootstrapError::DuplicateNode(_)
            | BootstrapError::UnknownDependency { .. }
            | BootstrapError::UnknownNode(_) => CONFIG,
            BootstrapError::Cancelled => INTERRUPTED,
            _ => FAILURE,
        };
    }
    if err.downcast_ref::<MigrationError>().is_some() {
        return MIGRATION_FAILED;
    }
    if err.downcast_ref::<InvalidConfig>().is_some() || err.downcast_ref::<ConfigError>().is_some()
    {
        return CONFIG;
    }
    FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use orchard_core::TenantId;

    #[test]
    fn bootstrap_errors_map_to_codes() {
        let cases = [
            (
                BootstrapError::CycleDetected {
                    cycle: vec!["a".into(), "b".into(), "a".into()],
                },
                CYCLE_DETECTED,
            ),
            (
                BootstrapError::DependencyFailed {
                    node: "db".into(),
                    dependency: "mysql".into(),
                },
                DEPENDENCY_FAILED,
            ),
            (BootstrapError::TimedOut { node: "mysql".into() }, TIMED_OUT),
            (
                BootstrapError::IncompleteBindings {
                    action: "AutoSetup".into(),
                    missing: vec!["x".into()],
                },
                INCOMPLETE_BINDINGS,
            ),
            (
                BootstrapError::ReadinessFailed {
                    node: "mysql".into(),
                    reason: "refused".into(),
                },
                READINESS_FAILED,
            ),
        ];
        for (error, code) in cases {
            assert_eq!(code_for(&anyhow::Error::new(error)), code);
        }
    }

    #[test]
    fn context_does_not_hide_the_cause() {
        let err = Err::<(), _>(BootstrapError::TimedOut { node: "mysql".into() })
            .context("orchestration")
            .unwrap_err();
        assert_eq!(code_for(&err), TIMED_OUT);
    }

    #[test]
    fn config_and_migration_errors() {
        let config = Err::<(), _>(anyhow::anyhow!("missing field `kind`"))
            .context(InvalidConfig::new(Path::new("orchard.toml")))
            .unwrap_err();
        assert_eq!(code_for(&config), CONFIG);

        let migration = anyhow::Error::new(MigrationError::Execution {
            tenant: TenantId::new("T1"),
            recipe: "import.json".into(),
            reason: "boom".into(),
        });
        assert_eq!(code_for(&migration), MIGRATION_FAILED);

        assert_eq!(code_for(&anyhow::anyhow!("something else")), FAILURE);
    }
}
