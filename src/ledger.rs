//! Durable ledger tables for applied migrations and recorded backups.
//!
//! Both tables live inside the managed database file itself. Rows are
//! appended and deleted, never mutated in place: a migration row is inserted
//! in the same transaction as its `up()` and removed in the same transaction
//! as its `down()`.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::migration::INITIAL_VERSION;

const CREATE_LEDGER_TABLES_SQL: &str = r"
CREATE TABLE IF NOT EXISTS migration_history (
  version TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT NOT NULL,
  applied_at TEXT NOT NULL,
  execution_time REAL NOT NULL,
  rollback_available INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS backup_history (
  backup_id TEXT PRIMARY KEY,
  filename TEXT NOT NULL,
  file_path TEXT NOT NULL,
  backup_type TEXT NOT NULL,
  compression INTEGER NOT NULL,
  checksum TEXT NOT NULL,
  size_bytes INTEGER NOT NULL,
  created_at TEXT NOT NULL
);
";

/// Ledger row for one applied migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
    pub description: String,
    pub applied_at: DateTime<Utc>,
    /// Wall-clock seconds spent in the script's `up()` call.
    pub execution_time: f64,
    pub rollback_available: bool,
}

/// Ledger row for one recorded backup snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    pub filename: String,
    pub file_path: PathBuf,
    /// Free-form tag: `manual`, `pre_migration`, `pre_rollback`, ...
    pub backup_type: String,
    pub compression: bool,
    /// SHA-256 hex digest of the uncompressed database bytes.
    pub checksum: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn ensure_ledger_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_LEDGER_TABLES_SQL)
}

/// Fixed-width RFC3339 (microsecond precision) so the TEXT columns sort
/// chronologically.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp_column(raw: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw).map(|dt| dt.with_timezone(&Utc)).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

pub(crate) fn applied_versions(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT version FROM migration_history ORDER BY version ASC")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

pub(crate) fn current_version(conn: &Connection) -> rusqlite::Result<String> {
    let version: Option<String> =
        conn.query_row("SELECT MAX(version) FROM migration_history", [], |row| row.get(0))?;
    Ok(version.unwrap_or_else(|| INITIAL_VERSION.to_string()))
}

pub(crate) fn insert_migration_record(
    tx: &Transaction<'_>,
    record: &MigrationRecord,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO migration_history(
            version, name, description, applied_at, execution_time, rollback_available
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.version,
            record.name,
            record.description,
            format_timestamp(record.applied_at),
            record.execution_time,
            record.rollback_available,
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_migration_record(tx: &Transaction<'_>, version: &str) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM migration_history WHERE version = ?1", [version])?;
    Ok(())
}

/// Full ledger, oldest first / newest last. Version order equals apply order
/// because applied versions form a contiguous prefix of the registry.
pub(crate) fn migration_history(conn: &Connection) -> rusqlite::Result<Vec<MigrationRecord>> {
    let mut stmt = conn.prepare(
        "SELECT version, name, description, applied_at, execution_time, rollback_available
         FROM migration_history ORDER BY version ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(MigrationRecord {
            version: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            applied_at: timestamp_column(row.get(3)?, 3)?,
            execution_time: row.get(4)?,
            rollback_available: row.get(5)?,
        })
    })?;
    rows.collect()
}

pub(crate) fn insert_backup_record(
    conn: &Connection,
    record: &BackupRecord,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO backup_history(
            backup_id, filename, file_path, backup_type, compression, checksum, size_bytes, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.backup_id,
            record.filename,
            record.file_path.to_string_lossy(),
            record.backup_type,
            record.compression,
            record.checksum,
            record.size_bytes,
            format_timestamp(record.created_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_backup_record(conn: &Connection, backup_id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute("DELETE FROM backup_history WHERE backup_id = ?1", [backup_id])?;
    Ok(changed > 0)
}

fn backup_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupRecord> {
    Ok(BackupRecord {
        backup_id: row.get(0)?,
        filename: row.get(1)?,
        file_path: PathBuf::from(row.get::<_, String>(2)?),
        backup_type: row.get(3)?,
        compression: row.get(4)?,
        checksum: row.get(5)?,
        size_bytes: row.get(6)?,
        created_at: timestamp_column(row.get(7)?, 7)?,
    })
}

pub(crate) fn get_backup_record(
    conn: &Connection,
    backup_id: &str,
) -> rusqlite::Result<Option<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT backup_id, filename, file_path, backup_type, compression, checksum, size_bytes, created_at
         FROM backup_history WHERE backup_id = ?1",
    )?;
    stmt.query_row([backup_id], backup_row).optional()
}

/// All recorded backups ordered by creation time, most recent last.
pub(crate) fn list_backup_records(conn: &Connection) -> rusqlite::Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT backup_id, filename, file_path, backup_type, compression, checksum, size_bytes, created_at
         FROM backup_history ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt.query_map([], backup_row)?;
    rows.collect()
}

/// Overwrite the backup ledger with `records` in one transaction. Used after
/// a file restore: the snapshot carries the ledger as of its creation, but
/// the pre-restore ledger is authoritative for which backups exist on disk.
pub(crate) fn replace_backup_records(
    conn: &mut Connection,
    records: &[BackupRecord],
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM backup_history", [])?;
    for record in records {
        insert_backup_record(&tx, record)?;
    }
    tx.commit()
}

pub(crate) fn backup_count(conn: &Connection) -> rusqlite::Result<usize> {
    let count: i64 =
        conn.query_row("SELECT COUNT(*) FROM backup_history", [], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or_default())
}
