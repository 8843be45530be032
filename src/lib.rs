//! dbvault — schema migration and backup/restore engine for single-file
//! SQLite databases.
//!
//! The engine tracks schema evolution in a durable ledger, moves the schema
//! forward (`migrate`) or backward (`rollback`) one transaction per step,
//! and snapshots/restores the whole database file with optional gzip
//! compression and SHA-256 integrity verification.
//!
//! This is a library, not a service: the owning application constructs a
//! [`MigrationManager`] (or asks a [`ManagerRegistry`] for one) and calls
//! its query and mutation surface directly. The design assumes a single
//! active writer per database file; multi-process deployments must add an
//! external advisory lock around `migrate`/`rollback`/`restore_backup`.

pub mod backup;
pub mod ledger;
pub mod manager;
pub mod migration;
pub mod registry;

pub use backup::BackupError;
pub use ledger::{BackupRecord, MigrationRecord};
pub use manager::{
    DatabaseStats, ManagerConfig, MigrateReport, MigrationFailure, MigrationManager,
    PendingMigration, RollbackReport, TableStats,
};
pub use migration::{MigrationError, MigrationScript, INITIAL_VERSION};
pub use registry::ManagerRegistry;
