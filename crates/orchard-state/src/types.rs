//! Persisted record types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use orchard_core::{ResourceKind, TenantId};

/// Identity of a resource that must be the same on every run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceIdentity {
    pub name: String,
    pub kind: ResourceKind,
    pub host: String,
    pub ports: BTreeMap<String, u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Unix timestamp (seconds) when the identity was first minted.
    pub created_at: u64,
}

impl ResourceIdentity {
    pub fn table_key(&self) -> &str {
        &self.name
    }
}

/// Whether a tenant's recipe has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    NotApplied,
    Applied,
}

/// Migration progress of one recipe for one tenant.
///
/// `applied_version` starts at 0 and never decreases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantMigrationRecord {
    pub tenant_id: TenantId,
    pub recipe_name: String,
    pub applied_version: u32,
    /// sha256 of the recipe file at the time it was applied.
    pub recipe_digest: Option<String>,
    /// Number of recipe executions started, successful or not.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub applied_at: Option<u64>,
}

impl TenantMigrationRecord {
    /// A freshly provisioned record (`applied_version = 0`).
    pub fn new(tenant_id: &TenantId, recipe_name: &str, now: u64) -> Self {
        Self {
            tenant_id: tenant_id.clone(),
            recipe_name: recipe_name.to_string(),
            applied_version: 0,
            recipe_digest: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            applied_at: None,
        }
    }

    pub fn table_key(&self) -> String {
        migration_key(&self.tenant_id, &self.recipe_name)
    }

    pub fn state(&self) -> MigrationState {
        if self.applied_version >= 1 {
            MigrationState::Applied
        } else {
            MigrationState::NotApplied
        }
    }

    pub fn is_applied(&self) -> bool {
        self.state() == MigrationState::Applied
    }
}

/// Composite key of a tenant migration record.
pub fn migration_key(tenant_id: &TenantId, recipe_name: &str) -> String {
    format!("{tenant_id}/{recipe_name}")
}

pub(crate) fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
