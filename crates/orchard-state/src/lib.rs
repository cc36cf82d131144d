//! orchard-state — embedded state store for the Orchard host.
//!
//! Backed by [redb](https://docs.rs/redb), holds the two kinds of state that
//! must outlive a single orchestration run:
//!
//! - resource identities of `persistent` nodes (host, ports, credentials),
//!   so successive runs bind identical connection facts;
//! - tenant migration records, so a setup recipe is applied once per tenant.
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).
//! redb serializes write transactions, and a database file can only be
//! opened by one process at a time.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{CommitOutcome, StateStore};
pub use types::*;
