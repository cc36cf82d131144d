//! redb-backed persistence for the Orchard host.
//!
//! Typed operations over resource identities and tenant migration records.
//! Every read-modify-write of a record happens inside a single redb write
//! transaction, so the re-check and the update can never interleave with
//! another writer.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use orchard_core::TenantId;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Result of trying to advance a tenant migration record.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// `applied_version` was advanced by this commit.
    Advanced(TenantMigrationRecord),
    /// Another writer already advanced it; nothing was written.
    AlreadyApplied(TenantMigrationRecord),
}

impl CommitOutcome {
    pub fn record(&self) -> &TenantMigrationRecord {
        match self {
            CommitOutcome::Advanced(r) | CommitOutcome::AlreadyApplied(r) => r,
        }
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    ///
    /// Fails with `StateError::Locked` while another handle holds the file.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
        }
        let db = Database::create(path).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => {
                StateError::Locked(path.display().to_string())
            }
            other => StateError::Open(other.to_string()),
        })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(IDENTITIES).map_err(map_err!(Table))?;
        txn.open_table(TENANT_MIGRATIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Resource identities ────────────────────────────────────────

    /// Insert or replace a resource identity.
    pub fn put_identity(&self, identity: &ResourceIdentity) -> StateResult<()> {
        let value = encode(identity)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(IDENTITIES).map_err(map_err!(Table))?;
            table
                .insert(identity.table_key(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(resource = %identity.name, "identity stored");
        Ok(())
    }

    pub fn get_identity(&self, name: &str) -> StateResult<Option<ResourceIdentity>> {
        self.get_json(IDENTITIES, name)
    }

    pub fn list_identities(&self) -> StateResult<Vec<ResourceIdentity>> {
        self.list_json(IDENTITIES)
    }

    /// Return the stored identity for `candidate.name`, storing `candidate`
    /// first if there is none. The flag is true when `candidate` was stored.
    pub fn get_or_insert_identity(
        &self,
        candidate: &ResourceIdentity,
    ) -> StateResult<(ResourceIdentity, bool)> {
        let key = candidate.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut table = txn.open_table(IDENTITIES).map_err(map_err!(Table))?;
            let existing = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            match existing {
                Some(bytes) => (decode(key, &bytes)?, false),
                None => {
                    let value = encode(candidate)?;
                    table
                        .insert(key, value.as_slice())
                        .map_err(map_err!(Write))?;
                    (candidate.clone(), true)
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if result.1 {
            debug!(resource = %key, "identity minted");
        }
        Ok(result)
    }

    // ── Tenant migrations ──────────────────────────────────────────

    /// Create the record with `applied_version = 0` unless it already exists.
    pub fn provision_tenant(
        &self,
        tenant_id: &TenantId,
        recipe_name: &str,
    ) -> StateResult<TenantMigrationRecord> {
        let (record, _) = self.update_migration(tenant_id, recipe_name, |_| false)?;
        Ok(record)
    }

    pub fn get_migration(
        &self,
        tenant_id: &TenantId,
        recipe_name: &str,
    ) -> StateResult<Option<TenantMigrationRecord>> {
        self.get_json(TENANT_MIGRATIONS, &migration_key(tenant_id, recipe_name))
    }

    pub fn list_migrations(&self) -> StateResult<Vec<TenantMigrationRecord>> {
        self.list_json(TENANT_MIGRATIONS)
    }

    /// Count one more execution attempt before the recipe runs.
    pub fn record_attempt(
        &self,
        tenant_id: &TenantId,
        recipe_name: &str,
    ) -> StateResult<TenantMigrationRecord> {
        let now = epoch_secs();
        let (record, _) = self.update_migration(tenant_id, recipe_name, |rec| {
            rec.attempts += 1;
            rec.updated_at = now;
            true
        })?;
        Ok(record)
    }

    /// Remember why the last attempt failed. `applied_version` is untouched.
    pub fn record_failure(
        &self,
        tenant_id: &TenantId,
        recipe_name: &str,
        error: &str,
    ) -> StateResult<TenantMigrationRecord> {
        let now = epoch_secs();
        let (record, _) = self.update_migration(tenant_id, recipe_name, |rec| {
            rec.last_error = Some(error.to_string());
            rec.updated_at = now;
            true
        })?;
        Ok(record)
    }

    /// Advance `applied_version` unless it is already applied.
    ///
    /// The check and the increment run in one write transaction.
    pub fn commit_migration(
        &self,
        tenant_id: &TenantId,
        recipe_name: &str,
        recipe_digest: Option<&str>,
    ) -> StateResult<CommitOutcome> {
        let now = epoch_secs();
        let (record, advanced) = self.update_migration(tenant_id, recipe_name, |rec| {
            if rec.is_applied() {
                return false;
            }
            rec.applied_version += 1;
            rec.recipe_digest = recipe_digest.map(str::to_string);
            rec.last_error = None;
            rec.applied_at = Some(now);
            rec.updated_at = now;
            true
        })?;
        debug!(tenant = %tenant_id, recipe = recipe_name, advanced, "migration commit");
        Ok(if advanced {
            CommitOutcome::Advanced(record)
        } else {
            CommitOutcome::AlreadyApplied(record)
        })
    }

    /// Read-modify-write one migration record in a single write transaction.
    ///
    /// Absent records start from `TenantMigrationRecord::new` and are always
    /// written; present ones only when `apply` returns true.
    fn update_migration(
        &self,
        tenant_id: &TenantId,
        recipe_name: &str,
        apply: impl FnOnce(&mut TenantMigrationRecord) -> bool,
    ) -> StateResult<(TenantMigrationRecord, bool)> {
        let key = migration_key(tenant_id, recipe_name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut table = txn
                .open_table(TENANT_MIGRATIONS)
                .map_err(map_err!(Table))?;
            let existing = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let (mut record, absent) = match existing {
                Some(bytes) => (decode::<TenantMigrationRecord>(&key, &bytes)?, false),
                None => (
                    TenantMigrationRecord::new(tenant_id, recipe_name, epoch_secs()),
                    true,
                ),
            };
            let changed = apply(&mut record);
            if changed || absent {
                let value = encode(&record)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            (record, changed)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(key, guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(key.value(), value.value())?);
        }
        Ok(results)
    }
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use orchard_core::ResourceKind;

    fn test_identity(name: &str, password: &str) -> ResourceIdentity {
        ResourceIdentity {
            name: name.to_string(),
            kind: ResourceKind::EngineInstance,
            host: "127.0.0.1".to_string(),
            ports: BTreeMap::from([("port".to_string(), 3306)]),
            username: Some("root".to_string()),
            password: Some(password.to_string()),
            created_at: 1000,
        }
    }

    fn tenant() -> TenantId {
        TenantId::new("T1")
    }

    // ── Identities ─────────────────────────────────────────────────

    #[test]
    fn identity_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let identity = test_identity("mysql", "s3cret");

        store.put_identity(&identity).unwrap();
        assert_eq!(store.get_identity("mysql").unwrap(), Some(identity));
        assert!(store.get_identity("postgres").unwrap().is_none());
    }

    #[test]
    fn get_or_insert_keeps_first_identity() {
        let store = StateStore::open_in_memory().unwrap();

        let (first, inserted) = store
            .get_or_insert_identity(&test_identity("mysql", "first"))
            .unwrap();
        assert!(inserted);
        assert_eq!(first.password.as_deref(), Some("first"));

        let (second, inserted) = store
            .get_or_insert_identity(&test_identity("mysql", "second"))
            .unwrap();
        assert!(!inserted);
        assert_eq!(second, first);
        assert_eq!(store.list_identities().unwrap().len(), 1);
    }

    // ── Tenant migrations ──────────────────────────────────────────

    #[test]
    fn provision_creates_unapplied_record_once() {
        let store = StateStore::open_in_memory().unwrap();

        let record = store.provision_tenant(&tenant(), "import.json").unwrap();
        assert_eq!(record.applied_version, 0);
        assert_eq!(record.state(), MigrationState::NotApplied);

        store.record_attempt(&tenant(), "import.json").unwrap();
        let again = store.provision_tenant(&tenant(), "import.json").unwrap();
        assert_eq!(again.attempts, 1);
        assert_eq!(store.list_migrations().unwrap().len(), 1);
    }

    #[test]
    fn attempts_accumulate() {
        let store = StateStore::open_in_memory().unwrap();
        store.record_attempt(&tenant(), "import.json").unwrap();
        let record = store.record_attempt(&tenant(), "import.json").unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.applied_version, 0);
    }

    #[test]
    fn commit_advances_exactly_once() {
        let store = StateStore::open_in_memory().unwrap();
        store.provision_tenant(&tenant(), "import.json").unwrap();

        let first = store
            .commit_migration(&tenant(), "import.json", Some("abc"))
            .unwrap();
        assert!(matches!(first, CommitOutcome::Advanced(_)));
        assert_eq!(first.record().applied_version, 1);
        assert_eq!(first.record().recipe_digest.as_deref(), Some("abc"));
        assert!(first.record().applied_at.is_some());

        let second = store
            .commit_migration(&tenant(), "import.json", Some("def"))
            .unwrap();
        assert!(matches!(second, CommitOutcome::AlreadyApplied(_)));
        assert_eq!(second.record().applied_version, 1);
        assert_eq!(second.record().recipe_digest.as_deref(), Some("abc"));
    }

    #[test]
    fn failure_keeps_version() {
        let store = StateStore::open_in_memory().unwrap();
        store.provision_tenant(&tenant(), "import.json").unwrap();

        let record = store
            .record_failure(&tenant(), "import.json", "content type missing")
            .unwrap();
        assert_eq!(record.applied_version, 0);
        assert_eq!(record.last_error.as_deref(), Some("content type missing"));

        let record = store
            .commit_migration(&tenant(), "import.json", None)
            .unwrap();
        assert_eq!(record.record().last_error, None);
    }

    #[test]
    fn records_are_scoped_per_tenant_and_recipe() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .commit_migration(&tenant(), "import.json", None)
            .unwrap();

        let other_tenant = store
            .get_migration(&TenantId::new("T2"), "import.json")
            .unwrap();
        assert!(other_tenant.is_none());

        let other_recipe = store.provision_tenant(&tenant(), "blog.json").unwrap();
        assert_eq!(other_recipe.applied_version, 0);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state").join("tenants.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .commit_migration(&tenant(), "import.json", None)
                .unwrap();
            store.put_identity(&test_identity("mysql", "pw")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let record = store.get_migration(&tenant(), "import.json").unwrap();
        assert_eq!(record.unwrap().applied_version, 1);
        assert!(store.get_identity("mysql").unwrap().is_some());
    }

    #[test]
    fn second_open_reports_locked() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tenants.redb");

        let held = StateStore::open(&db_path).unwrap();
        assert!(matches!(StateStore::open(&db_path), Err(StateError::Locked(_))));

        drop(held);
        assert!(StateStore::open(&db_path).is_ok());
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_identities().unwrap().is_empty());
        assert!(store.list_migrations().unwrap().is_empty());
        assert!(store.get_migration(&tenant(), "x").unwrap().is_none());
    }
}
