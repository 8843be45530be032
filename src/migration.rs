//! Migration script contract and registry validation.
//!
//! A migration is a versioned, reversible unit of schema change. Scripts
//! receive a caller-supplied transaction and must not commit or roll back
//! themselves; the manager owns all transaction boundaries.

use rusqlite::Transaction;
use thiserror::Error;

use crate::backup::BackupError;

/// Sentinel version reported when no migration has been applied yet.
pub const INITIAL_VERSION: &str = "000";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),
    #[error("Duplicate migration version: {0}")]
    DuplicateVersion(String),
    #[error("No registered migration for version {0}")]
    UnknownVersion(String),
    #[error("Migration {version} failed post-apply validation")]
    ValidationFailed { version: String },
    #[error("Migration {version} does not support rollback")]
    RollbackUnsupported { version: String },
    #[error("Migration failed: {0}")]
    Script(String),
}

/// A self-describing, reversible unit of schema change.
///
/// Versions are fixed-width zero-padded decimal strings ("001", "002", ...)
/// so lexicographic order matches numeric order. Versions must be unique
/// within a manager.
pub trait MigrationScript: Send + Sync {
    /// Zero-padded version string defining this script's place in the order.
    fn version(&self) -> &str;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Forward schema change. Runs inside a manager-owned transaction.
    fn up(&self, tx: &Transaction<'_>) -> Result<(), MigrationError>;

    /// Exact inverse of `up`. Scripts without a usable inverse should return
    /// an error here and report `rollback_available() == false`.
    fn down(&self, tx: &Transaction<'_>) -> Result<(), MigrationError>;

    /// Structural post-condition check, run right after `up` inside the same
    /// transaction. Returning `false` fails the migration exactly as if `up`
    /// had errored.
    fn validate(&self, _tx: &Transaction<'_>) -> Result<bool, MigrationError> {
        Ok(true)
    }

    /// Whether `down` performs a real inverse. Recorded in the ledger.
    fn rollback_available(&self) -> bool {
        true
    }
}

/// Sort scripts ascending by version and reject duplicates.
/// Runs once, at manager construction.
pub(crate) fn validate_and_sort(
    mut scripts: Vec<Box<dyn MigrationScript>>,
) -> Result<Vec<Box<dyn MigrationScript>>, MigrationError> {
    scripts.sort_by(|a, b| a.version().cmp(b.version()));
    for pair in scripts.windows(2) {
        if pair[0].version() == pair[1].version() {
            return Err(MigrationError::DuplicateVersion(
                pair[0].version().to_string(),
            ));
        }
    }
    Ok(scripts)
}
