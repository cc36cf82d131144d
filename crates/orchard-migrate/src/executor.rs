//! Once-per-tenant migration executor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use orchard_core::TenantId;
use orchard_state::{CommitOutcome, TenantMigrationRecord};

use crate::error::{MigrationError, MigrationResult};
use crate::recipe::{Recipe, RecipeRunner};
use crate::store::{TenantLock, TenantStore};

/// Result of a migration request.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    /// The recipe ran and this call advanced the version.
    Applied(TenantMigrationRecord),
    /// Nothing to do; the tenant was already migrated.
    AlreadyApplied(TenantMigrationRecord),
}

impl MigrationOutcome {
    pub fn record(&self) -> &TenantMigrationRecord {
        match self {
            MigrationOutcome::Applied(r) | MigrationOutcome::AlreadyApplied(r) => r,
        }
    }
}

/// First phase of a migration.
pub enum Begin {
    AlreadyApplied(TenantMigrationRecord),
    /// The recipe ran; the version advances on `commit`.
    Pending(PendingMigration),
}

/// A recipe that succeeded but is not yet recorded as applied.
///
/// Dropping it without `commit` leaves the tenant at `applied_version = 0`,
/// exactly like a crash between execution and commit.
pub struct PendingMigration {
    store: TenantStore,
    tenant: TenantId,
    recipe: Recipe,
    _lock: OwnedMutexGuard<()>,
    _file_lock: Option<TenantLock>,
}

impl PendingMigration {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Advance the version. Re-checks the record in the same write
    /// transaction, so a concurrent commit is reported as `AlreadyApplied`.
    pub async fn commit(self) -> MigrationResult<MigrationOutcome> {
        let outcome = self
            .store
            .with(|s| s.commit_migration(&self.tenant, &self.recipe.name, Some(&self.recipe.digest)))
            .await?;
        Ok(match outcome {
            CommitOutcome::Advanced(record) => {
                info!(
                    tenant = %self.tenant,
                    recipe = %self.recipe.name,
                    version = record.applied_version,
                    "migration applied"
                );
                MigrationOutcome::Applied(record)
            }
            CommitOutcome::AlreadyApplied(record) => {
                warn!(
                    tenant = %self.tenant,
                    recipe = %self.recipe.name,
                    "migration was committed concurrently, keeping existing record"
                );
                MigrationOutcome::AlreadyApplied(record)
            }
        })
    }
}

pub struct MigrationExecutor {
    store: TenantStore,
    runner: Arc<dyn RecipeRunner>,
    locks: Mutex<HashMap<TenantId, Arc<AsyncMutex<()>>>>,
}

impl MigrationExecutor {
    pub fn new(store: impl Into<TenantStore>, runner: Arc<dyn RecipeRunner>) -> Self {
        Self {
            store: store.into(),
            runner,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &TenantStore {
        &self.store
    }

    /// Run the recipe for `tenant` unless it was already applied.
    pub async fn run(&self, tenant: &TenantId, recipe: &Recipe) -> MigrationResult<MigrationOutcome> {
        match self.begin(tenant, recipe).await? {
            Begin::AlreadyApplied(record) => Ok(MigrationOutcome::AlreadyApplied(record)),
            Begin::Pending(pending) => pending.commit().await,
        }
    }

    /// Lock the tenant, count the attempt and run the recipe, without
    /// committing. The tenant stays locked until the pending migration is
    /// committed or dropped.
    pub async fn begin(&self, tenant: &TenantId, recipe: &Recipe) -> MigrationResult<Begin> {
        let lock = self.tenant_lock(tenant).lock_owned().await;
        let file_lock = self.store.lock_tenant(tenant).await?;

        let record = self
            .store
            .with(|s| s.provision_tenant(tenant, &recipe.name))
            .await?;
        if record.is_applied() {
            if record.recipe_digest.as_deref().is_some_and(|d| d != recipe.digest) {
                warn!(
                    tenant = %tenant,
                    recipe = %recipe.name,
                    "recipe changed since it was applied; not running it again"
                );
            }
            info!(tenant = %tenant, recipe = %recipe.name, "migration already applied");
            return Ok(Begin::AlreadyApplied(record));
        }

        let record = self
            .store
            .with(|s| s.record_attempt(tenant, &recipe.name))
            .await?;
        info!(
            tenant = %tenant,
            recipe = %recipe.name,
            attempt = record.attempts,
            "applying recipe"
        );

        let started = Instant::now();
        if let Err(e) = self.runner.run(tenant, recipe).await {
            warn!(
                tenant = %tenant,
                recipe = %recipe.name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "recipe failed"
            );
            let recorded = self
                .store
                .with(|s| s.record_failure(tenant, &recipe.name, &e.0))
                .await;
            if let Err(store_error) = recorded {
                warn!(tenant = %tenant, error = %store_error, "could not record recipe failure");
            }
            return Err(MigrationError::Execution {
                tenant: tenant.clone(),
                recipe: recipe.name.clone(),
                reason: e.0,
            });
        }

        Ok(Begin::Pending(PendingMigration {
            store: self.store.clone(),
            tenant: tenant.clone(),
            recipe: recipe.clone(),
            _lock: lock,
            _file_lock: file_lock,
        }))
    }

    fn tenant_lock(&self, tenant: &TenantId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(tenant.clone()).or_default().clone()
    }
}
