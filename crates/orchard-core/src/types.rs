//! Shared types used across Orchard host crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What kind of backing resource a node describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// A database server process (MySQL, PostgreSQL).
    EngineInstance,
    /// A named database inside an engine instance.
    LogicalDatabase,
    /// A blob/queue/table storage emulator (Azurite).
    StorageEmulator,
    /// A blob container inside a storage emulator.
    BlobContainer,
    /// An externally supplied value, e.g. an administrator secret.
    Parameter,
}

impl ResourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::EngineInstance => "engine-instance",
            ResourceKind::LogicalDatabase => "logical-database",
            ResourceKind::StorageEmulator => "storage-emulator",
            ResourceKind::BlobContainer => "blob-container",
            ResourceKind::Parameter => "parameter",
        }
    }

    /// Kinds whose readiness is a process-liveness poll.
    pub fn is_process(&self) -> bool {
        matches!(
            self,
            ResourceKind::EngineInstance | ResourceKind::StorageEmulator
        )
    }

    /// The kind a node of this kind must be nested under, if any.
    pub fn parent_kind(&self) -> Option<ResourceKind> {
        match self {
            ResourceKind::LogicalDatabase => Some(ResourceKind::EngineInstance),
            ResourceKind::BlobContainer => Some(ResourceKind::StorageEmulator),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether a resource survives across orchestration runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifetime {
    /// Fresh identity on every run.
    #[default]
    Ephemeral,
    /// Same identity (host, ports, credentials) on every run.
    #[serde(alias = "persistent-across-runs")]
    Persistent,
}

/// Connection-string dialect of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineFlavor {
    #[default]
    Mysql,
    Postgres,
}

impl EngineFlavor {
    /// Administrative user the engine is started with.
    pub fn default_user(&self) -> &'static str {
        match self {
            EngineFlavor::Mysql => "root",
            EngineFlavor::Postgres => "postgres",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            EngineFlavor::Mysql => 3306,
            EngineFlavor::Postgres => 5432,
        }
    }
}

/// Lifecycle state of a resource node during one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeState {
    Declared,
    Starting,
    Ready,
    Failed { reason: FailureReason },
}

impl NodeState {
    pub fn is_ready(&self) -> bool {
        matches!(self, NodeState::Ready)
    }
}

/// Why a node ended up `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// The node's own readiness probe failed.
    Probe { message: String },
    /// The readiness deadline expired.
    TimedOut,
    /// An upstream node failed; carries the root failing node.
    DependencyFailed { dependency: String },
    /// The run was cancelled before the node settled.
    Cancelled,
}

impl FailureReason {
    /// Whether this node is the origin of the failure (not a dependent).
    pub fn is_root(&self) -> bool {
        matches!(self, FailureReason::Probe { .. } | FailureReason::TimedOut)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Probe { message } => write!(f, "probe failed: {message}"),
            FailureReason::TimedOut => f.write_str("timed out"),
            FailureReason::DependencyFailed { dependency } => {
                write!(f, "dependency '{dependency}' failed")
            }
            FailureReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Upper-snake form of a name for environment keys.
///
/// `connectionString` → `CONNECTION_STRING`, `admin-password` → `ADMIN_PASSWORD`.
/// Distinct names can share a segment (`ContentDb`, `content-db`).
pub fn env_segment(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if ch.is_ascii_uppercase() && prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_uppercase());
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        } else {
            if !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out
}

/// Identifies a logical application instance (tenant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
