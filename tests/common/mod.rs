//! Shared fixtures for the integration tests.

use dbvault::{ManagerConfig, MigrationError, MigrationManager, MigrationScript};
use rusqlite::Transaction;
use tempfile::TempDir;

/// Migration that creates (up) and drops (down) one table, validating that
/// the table actually exists afterwards.
pub struct CreateTable {
    pub version: &'static str,
    pub table: &'static str,
}

impl MigrationScript for CreateTable {
    fn version(&self) -> &str {
        self.version
    }
    fn name(&self) -> &str {
        self.table
    }
    fn description(&self) -> &str {
        "create one table"
    }
    fn up(&self, tx: &Transaction<'_>) -> Result<(), MigrationError> {
        tx.execute(
            &format!("CREATE TABLE {} (id INTEGER PRIMARY KEY, body TEXT)", self.table),
            [],
        )?;
        Ok(())
    }
    fn down(&self, tx: &Transaction<'_>) -> Result<(), MigrationError> {
        tx.execute(&format!("DROP TABLE {}", self.table), [])?;
        Ok(())
    }
    fn validate(&self, tx: &Transaction<'_>) -> Result<bool, MigrationError> {
        Ok(table_exists_in(tx, self.table)?)
    }
}

pub fn table_exists_in(tx: &Transaction<'_>, table: &str) -> Result<bool, MigrationError> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count == 1)
}

pub fn manager_with(dir: &TempDir, scripts: Vec<Box<dyn MigrationScript>>) -> MigrationManager {
    let config = ManagerConfig::for_database(dir.path().join("app.db"));
    MigrationManager::new(config, scripts).expect("manager should construct")
}

/// Whether a user table is visible through the manager's stats surface.
pub fn table_exists(manager: &MigrationManager, table: &str) -> bool {
    manager
        .get_database_stats()
        .expect("stats should be readable")
        .tables
        .iter()
        .any(|t| t.name == table)
}
