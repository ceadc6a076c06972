//! PostgreSQL implementations of the `durably` storage adapter, lock
//! manager, and cluster stores.
//!
//! Conditional appends take a transaction-scoped advisory lock whose scope is
//! derived from the adapter's serialization guarantee, so a crashed writer
//! auto-releases. Scans stream rows lazily in sequence-number order, pushing
//! recognized query constraints down into SQL.

#![deny(unsafe_code, trivial_casts)]
#![warn(clippy::all)]

pub mod lock;
pub mod mapping;
pub mod node;
pub mod query;
pub mod store;
pub mod subscriber;
pub mod subscription;

/// Embedded migrations for the tables used by this crate.
pub static MIGRATIONS: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use lock::PostgresLockManager;
pub use mapping::PostgresSourceMappingStore;
pub use node::PostgresNodeStateStore;
pub use store::PostgresEventStorageAdapter;
pub use subscriber::PostgresSubscriberStateStore;
pub use subscription::PostgresSubscriptionStateStore;
