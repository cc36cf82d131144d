//! redb table definitions for the Orchard state store.
//!
//! `&str` keys, `&[u8]` values holding JSON-serialized records.

use redb::TableDefinition;

/// Persistent resource identities keyed by `{resource_name}`.
pub const IDENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("identities");

/// Tenant migration records keyed by `{tenant_id}/{recipe_name}`.
pub const TENANT_MIGRATIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("tenant_migrations");
