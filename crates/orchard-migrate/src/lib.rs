//! orchard-migrate — apply a tenant's initial recipe exactly once.
//!
//! Every tenant moves from `NotApplied` (`applied_version = 0`) to `Applied`
//! (`applied_version >= 1`) at most once. The executor serialises work per
//! tenant, counts the attempt before running the recipe, and advances the
//! version only after the recipe succeeded, re-checking the record inside
//! the committing write transaction.
//!
//! Across processes, a file-backed [`TenantStore`] keeps the database
//! closed while recipes run and serialises each tenant with a lock file.
//!
//! A crash after the recipe ran but before the commit leaves the version at
//! 0, so the recipe runs again on the next start. Recipes must therefore be
//! idempotent in content.

pub mod error;
pub mod executor;
pub mod recipe;
pub mod store;

pub use error::{MigrationError, MigrationResult};
pub use executor::{Begin, MigrationExecutor, MigrationOutcome, PendingMigration};
pub use recipe::{BoxFuture, CommandRecipeRunner, Recipe, RecipeError, RecipeRunner};
pub use store::{TenantLock, TenantStore};
