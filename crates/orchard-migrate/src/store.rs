//! Tenant store access shared between processes.
//!
//! redb allows one open handle per database file. A file-backed
//! [`TenantStore`] opens the database around each record operation and
//! closes it again, so the file is free while a recipe runs. Work on one
//! tenant is serialised across processes by an advisory lock file next to
//! the database; different tenants never wait on each other's recipes.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::debug;

use orchard_core::TenantId;
use orchard_state::{StateError, StateResult, StateStore};

use crate::error::{MigrationError, MigrationResult};
use crate::recipe::sha256_hex;

const RETRY_START: Duration = Duration::from_millis(25);
const RETRY_MAX: Duration = Duration::from_millis(500);

/// Where the executor keeps tenant migration records.
#[derive(Clone)]
pub enum TenantStore {
    /// A store held open for the executor's lifetime.
    Open(StateStore),
    /// A database file opened per operation, waiting up to `wait` for
    /// other processes to release it.
    File { path: PathBuf, wait: Duration },
}

impl From<StateStore> for TenantStore {
    fn from(store: StateStore) -> Self {
        TenantStore::Open(store)
    }
}

impl TenantStore {
    pub fn file(path: impl Into<PathBuf>, wait: Duration) -> Self {
        TenantStore::File {
            path: path.into(),
            wait,
        }
    }

    /// Run one record operation against the store.
    pub async fn with<T>(
        &self,
        op: impl FnOnce(&StateStore) -> StateResult<T>,
    ) -> MigrationResult<T> {
        match self {
            TenantStore::Open(store) => Ok(op(store)?),
            TenantStore::File { path, wait } => {
                let store = open_when_free(path, *wait).await?;
                Ok(op(&store)?)
            }
        }
    }

    /// Hold `tenant` against other processes until the guard is dropped.
    ///
    /// An open store is already exclusive to this process, so no lock file
    /// is taken for it.
    pub async fn lock_tenant(&self, tenant: &TenantId) -> MigrationResult<Option<TenantLock>> {
        let TenantStore::File { path, wait } = self else {
            return Ok(None);
        };
        let lock_path = tenant_lock_path(path, tenant);
        let lock_error = |source| MigrationError::LockFile {
            path: lock_path.clone(),
            source,
        };

        if let Some(dir) = lock_path.parent() {
            std::fs::create_dir_all(dir).map_err(lock_error)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(lock_error)?;

        let deadline = Instant::now().checked_add(*wait);
        let mut delay = RETRY_START;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(tenant = %tenant, path = ?lock_path, "tenant lock acquired");
                    return Ok(Some(TenantLock { file }));
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if expired(deadline) {
                        return Err(MigrationError::Busy {
                            what: format!("tenant '{tenant}'"),
                            waited: *wait,
                        });
                    }
                    debug!(tenant = %tenant, "tenant locked by another process, waiting");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_MAX);
                }
                Err(e) => return Err(lock_error(e)),
            }
        }
    }
}

/// Exclusive hold on one tenant across processes.
pub struct TenantLock {
    file: File,
}

impl Drop for TenantLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Open the database, retrying with backoff while another handle holds it.
async fn open_when_free(path: &Path, wait: Duration) -> MigrationResult<StateStore> {
    let deadline = Instant::now().checked_add(wait);
    let mut delay = RETRY_START;
    loop {
        match StateStore::open(path) {
            Err(StateError::Locked(_)) if !expired(deadline) => {
                debug!(?path, delay_ms = delay.as_millis() as u64, "tenant store busy");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX);
            }
            Err(StateError::Locked(_)) => {
                return Err(MigrationError::Busy {
                    what: format!("tenant store {}", path.display()),
                    waited: wait,
                });
            }
            other => return Ok(other?),
        }
    }
}

/// No deadline (`None`) never expires.
fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// `<db dir>/locks/tenant-<digest>.lock`; the digest keeps any tenant id a
/// valid file name.
fn tenant_lock_path(db_path: &Path, tenant: &TenantId) -> PathBuf {
    let digest = sha256_hex(tenant.as_str().as_bytes());
    let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    dir.join("locks").join(format!("tenant-{}.lock", &digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_paths_are_per_tenant() {
        let db = Path::new("/srv/state/tenants.redb");
        let a = tenant_lock_path(db, &TenantId::new("Default"));
        let b = tenant_lock_path(db, &TenantId::new("Blog"));
        assert_ne!(a, b);
        assert!(a.starts_with("/srv/state/locks"));
        assert_eq!(a, tenant_lock_path(db, &TenantId::new("Default")));
    }

    #[tokio::test]
    async fn open_waits_for_the_other_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenants.redb");
        let held = StateStore::open(&path).unwrap();

        let store = TenantStore::file(&path, Duration::from_secs(5));
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(held);
        });
        let records = store.with(|s| s.list_migrations()).await.unwrap();
        assert!(records.is_empty());
        release.await.unwrap();
    }

    #[tokio::test]
    async fn open_gives_up_after_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenants.redb");
        let _held = StateStore::open(&path).unwrap();

        let store = TenantStore::file(&path, Duration::from_millis(100));
        assert!(matches!(
            store.with(|s| s.list_migrations()).await,
            Err(MigrationError::Busy { .. })
        ));
    }

    #[tokio::test]
    async fn tenant_lock_excludes_the_same_tenant_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = TenantStore::file(dir.path().join("tenants.redb"), Duration::from_millis(100));
        let tenant = TenantId::new("T1");

        let held = store.lock_tenant(&tenant).await.unwrap();
        assert!(held.is_some());
        assert!(store.lock_tenant(&TenantId::new("T2")).await.unwrap().is_some());
        assert!(matches!(
            store.lock_tenant(&tenant).await,
            Err(MigrationError::Busy { .. })
        ));

        drop(held);
        assert!(store.lock_tenant(&tenant).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn open_store_takes_no_lock_file() {
        let store = TenantStore::from(StateStore::open_in_memory().unwrap());
        assert!(store.lock_tenant(&TenantId::new("T1")).await.unwrap().is_none());
    }
}
