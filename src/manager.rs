//! Migration manager: orchestrates ordered schema migrations, safety
//! backups, snapshot restore, and read-only introspection over a single
//! SQLite database file.
//!
//! The manager assumes a single active writer per database file. Within one
//! process, migration application and rollback run strictly sequentially,
//! one transaction per migration; the transaction is the unit of atomicity,
//! not the overall `migrate()` call.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use crate::backup::{self, BackupError};
use crate::ledger::{self, BackupRecord, MigrationRecord};
use crate::migration::{validate_and_sort, MigrationError, MigrationScript};

/// Filesystem layout for one managed database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub db_path: PathBuf,
    pub migrations_dir: PathBuf,
    pub backups_dir: PathBuf,
}

impl ManagerConfig {
    pub fn new(
        db_path: impl Into<PathBuf>,
        migrations_dir: impl Into<PathBuf>,
        backups_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            migrations_dir: migrations_dir.into(),
            backups_dir: backups_dir.into(),
        }
    }

    /// Derive sibling `migrations/` and `backups/` directories next to the
    /// database file.
    pub fn for_database(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        let parent =
            db_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        Self {
            migrations_dir: parent.join("migrations"),
            backups_dir: parent.join("backups"),
            db_path,
        }
    }
}

/// The version that stopped a migrate/rollback run, plus why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationFailure {
    pub version: String,
    pub reason: String,
}

/// Outcome of a `migrate()` call. `failed` is set when a migration stopped
/// the run; everything in `applied` was committed before that point.
#[derive(Debug, Default, Serialize)]
pub struct MigrateReport {
    pub applied: Vec<String>,
    pub failed: Option<MigrationFailure>,
    pub backup_id: Option<String>,
}

impl MigrateReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }
}

/// Outcome of a `rollback()` call, mirror of [`MigrateReport`].
#[derive(Debug, Default, Serialize)]
pub struct RollbackReport {
    pub rolled_back: Vec<String>,
    pub failed: Option<MigrationFailure>,
    pub backup_id: Option<String>,
}

impl RollbackReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }
}

/// Registered migration that has not been applied yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    pub version: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub name: String,
    pub row_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub file_size_bytes: u64,
    pub current_version: String,
    pub tables: Vec<TableStats>,
    pub backup_count: usize,
}

/// Orchestrates migrations and backups for one database file. The manager
/// exclusively owns the two ledger tables and the backups directory.
pub struct MigrationManager {
    config: ManagerConfig,
    scripts: Vec<Box<dyn MigrationScript>>,
    conn: Mutex<Connection>,
}

fn open_database(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

/// Run one unit of work inside a transaction; commit on `Ok`, roll back on
/// `Err`. This is the only place transaction boundaries are drawn.
fn with_transaction<T>(
    conn: &mut Connection,
    work: impl FnOnce(&Transaction<'_>) -> Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    let tx = conn.transaction()?;
    let value = work(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn apply_one(conn: &mut Connection, script: &dyn MigrationScript) -> Result<(), MigrationError> {
    with_transaction(conn, |tx| {
        let started = Instant::now();
        script.up(tx)?;
        let execution_time = started.elapsed().as_secs_f64();
        if !script.validate(tx)? {
            return Err(MigrationError::ValidationFailed {
                version: script.version().to_string(),
            });
        }
        ledger::insert_migration_record(
            tx,
            &MigrationRecord {
                version: script.version().to_string(),
                name: script.name().to_string(),
                description: script.description().to_string(),
                applied_at: Utc::now(),
                execution_time,
                rollback_available: script.rollback_available(),
            },
        )?;
        Ok(())
    })
}

fn revert_one(conn: &mut Connection, script: &dyn MigrationScript) -> Result<(), MigrationError> {
    with_transaction(conn, |tx| {
        script.down(tx)?;
        ledger::delete_migration_record(tx, script.version())?;
        Ok(())
    })
}

fn side_file(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Rename the fully written snapshot over the live file, reopen it, and
/// reinstate the authoritative backup ledger.
fn swap_in_snapshot(
    db_path: &Path,
    staged: NamedTempFile,
    preserved: &[BackupRecord],
) -> Result<Connection, BackupError> {
    staged.persist(db_path).map_err(|err| BackupError::Io(err.error))?;
    let mut reopened = open_database(db_path)?;
    ledger::ensure_ledger_tables(&reopened)?;
    ledger::replace_backup_records(&mut reopened, preserved)?;
    Ok(reopened)
}

impl MigrationManager {
    /// Open (creating if absent) the database and its directories, ensure
    /// the ledger tables, and validate the migration registry.
    pub fn new(
        config: ManagerConfig,
        scripts: Vec<Box<dyn MigrationScript>>,
    ) -> Result<Self, MigrationError> {
        fs::create_dir_all(&config.migrations_dir)?;
        fs::create_dir_all(&config.backups_dir)?;
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = open_database(&config.db_path)?;
        ledger::ensure_ledger_tables(&conn)?;
        let scripts = validate_and_sort(scripts)?;

        info!(
            "migration manager ready for {:?} ({} registered migrations)",
            config.db_path,
            scripts.len()
        );
        Ok(Self { config, scripts, conn: Mutex::new(conn) })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn script_for(&self, version: &str) -> Result<&dyn MigrationScript, MigrationError> {
        self.scripts
            .iter()
            .find(|s| s.version() == version)
            .map(|s| &**s)
            .ok_or_else(|| MigrationError::UnknownVersion(version.to_string()))
    }

    // ---- introspection ----------------------------------------------------

    /// Highest version in the ledger, or `"000"` when nothing is applied.
    pub fn get_current_version(&self) -> Result<String, MigrationError> {
        let conn = self.conn.lock();
        Ok(ledger::current_version(&conn)?)
    }

    /// Registered migrations not yet present in the ledger, ascending.
    pub fn get_pending_migrations(&self) -> Result<Vec<PendingMigration>, MigrationError> {
        let applied = {
            let conn = self.conn.lock();
            ledger::applied_versions(&conn)?
        };
        Ok(self
            .scripts
            .iter()
            .filter(|s| !applied.iter().any(|v| v == s.version()))
            .map(|s| PendingMigration {
                version: s.version().to_string(),
                name: s.name().to_string(),
                description: s.description().to_string(),
            })
            .collect())
    }

    /// Full migration ledger, newest last.
    pub fn get_migration_history(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        let conn = self.conn.lock();
        Ok(ledger::migration_history(&conn)?)
    }

    /// File size, current version, per-table row counts, and backup count.
    /// Read-only; never mutates ledger or backup state.
    pub fn get_database_stats(&self) -> Result<DatabaseStats, MigrationError> {
        let conn = self.conn.lock();
        let file_size_bytes = fs::metadata(&self.config.db_path)?.len();
        let current_version = ledger::current_version(&conn)?;

        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            // Identifier comes from sqlite_master, not caller input.
            let count_sql = format!("SELECT COUNT(*) FROM \"{}\"", name.replace('"', "\"\""));
            let row_count: i64 = conn.query_row(&count_sql, [], |row| row.get(0))?;
            tables.push(TableStats { name, row_count });
        }

        let backup_count = ledger::backup_count(&conn)?;
        Ok(DatabaseStats { file_size_bytes, current_version, tables, backup_count })
    }

    // ---- apply / rollback -------------------------------------------------

    /// Apply every pending migration in ascending version order, one
    /// transaction per migration. The first failure rolls its transaction
    /// back and stops the run; earlier migrations stay committed.
    ///
    /// With `create_backup` a `pre_migration` snapshot is taken first, and a
    /// backup failure aborts the call before any schema change.
    pub fn migrate(&self, create_backup: bool) -> Result<MigrateReport, MigrationError> {
        let pending = self.get_pending_migrations()?;
        let mut report = MigrateReport::default();
        if pending.is_empty() {
            info!("no pending migrations for {:?}", self.config.db_path);
            return Ok(report);
        }

        if create_backup {
            report.backup_id = Some(self.create_backup("pre_migration", true)?);
        }

        let mut conn = self.conn.lock();
        for entry in &pending {
            let script = self.script_for(&entry.version)?;
            match apply_one(&mut conn, script) {
                Ok(()) => {
                    info!("applied migration {} ({})", entry.version, entry.name);
                    report.applied.push(entry.version.clone());
                }
                Err(err) => {
                    warn!("migration {} failed: {err}", entry.version);
                    report.failed = Some(MigrationFailure {
                        version: entry.version.clone(),
                        reason: err.to_string(),
                    });
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Roll back every applied migration with a version strictly greater
    /// than `target_version`, newest first. `"000"` undoes everything; a
    /// target outside the registry is valid. The first failure stops the
    /// sequence, leaving the ledger consistent with what was actually undone.
    pub fn rollback(
        &self,
        target_version: &str,
        create_backup: bool,
    ) -> Result<RollbackReport, MigrationError> {
        let mut to_undo = {
            let conn = self.conn.lock();
            ledger::applied_versions(&conn)?
        };
        to_undo.retain(|v| v.as_str() > target_version);
        to_undo.reverse();

        let mut report = RollbackReport::default();
        if to_undo.is_empty() {
            info!("nothing to roll back: ledger is at or below version {target_version}");
            return Ok(report);
        }

        if create_backup {
            report.backup_id = Some(self.create_backup("pre_rollback", true)?);
        }

        let mut conn = self.conn.lock();
        for version in &to_undo {
            let result = match self.script_for(version) {
                Ok(script) if !script.rollback_available() => {
                    Err(MigrationError::RollbackUnsupported { version: version.clone() })
                }
                Ok(script) => revert_one(&mut conn, script),
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    info!("rolled back migration {version}");
                    report.rolled_back.push(version.clone());
                }
                Err(err) => {
                    warn!("rollback of migration {version} failed: {err}");
                    report.failed = Some(MigrationFailure {
                        version: version.clone(),
                        reason: err.to_string(),
                    });
                    break;
                }
            }
        }
        Ok(report)
    }

    // ---- backup subsystem -------------------------------------------------

    /// Snapshot the live database file into the backups directory and record
    /// it in the ledger. Returns the new backup id. Partial files are
    /// removed on failure.
    pub fn create_backup(
        &self,
        backup_type: &str,
        compression: bool,
    ) -> Result<String, BackupError> {
        backup::validate_type_tag(backup_type)?;

        let created_at = Utc::now();
        let backup_id = backup::derive_backup_id(created_at, backup_type);
        let filename = backup::backup_filename(&backup_id, compression);
        let backup_path = self.config.backups_dir.join(&filename);

        let conn = self.conn.lock();
        // Flush WAL content into the main file so the copy is complete.
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;

        let (checksum, size_bytes) =
            match backup::write_snapshot(&self.config.db_path, &backup_path, compression) {
                Ok(result) => result,
                Err(err) => {
                    let _ = fs::remove_file(&backup_path);
                    return Err(err);
                }
            };

        let record = BackupRecord {
            backup_id: backup_id.clone(),
            filename,
            file_path: backup_path.clone(),
            backup_type: backup_type.to_string(),
            compression,
            checksum,
            size_bytes,
            created_at,
        };
        if let Err(err) = ledger::insert_backup_record(&conn, &record) {
            let _ = fs::remove_file(&backup_path);
            return Err(err.into());
        }

        info!("created {backup_type} backup {backup_id} ({size_bytes} bytes)");
        Ok(backup_id)
    }

    /// Recompute the stored file's checksum and compare it with the recorded
    /// one. Unknown ids, missing files, and undecodable streams all report
    /// `false` rather than raising, so callers can gate a restore on this.
    pub fn verify_backup_integrity(&self, backup_id: &str) -> Result<bool, BackupError> {
        let record = {
            let conn = self.conn.lock();
            ledger::get_backup_record(&conn, backup_id)?
        };
        let Some(record) = record else {
            warn!("integrity check: no record for backup {backup_id}");
            return Ok(false);
        };
        if !record.file_path.exists() {
            warn!("integrity check: backup file missing: {:?}", record.file_path);
            return Ok(false);
        }
        match backup::snapshot_checksum(&record.file_path, record.compression) {
            Ok(actual) if actual == record.checksum => Ok(true),
            Ok(actual) => {
                warn!(
                    "integrity check failed for {backup_id}: expected {}, got {actual}",
                    record.checksum
                );
                Ok(false)
            }
            Err(err) => {
                warn!("integrity check failed for {backup_id}: {err}");
                Ok(false)
            }
        }
    }

    /// Replace the live database with a stored snapshot.
    ///
    /// The snapshot is fully written to a temporary file in the database's
    /// directory and swapped in with an atomic rename, so a failed restore
    /// never leaves the live database truncated. With `verify_integrity`
    /// (the default posture) a checksum mismatch refuses the restore and
    /// returns `Ok(false)` without touching the live file.
    ///
    /// The snapshot's own copy of the backup ledger is as old as the
    /// snapshot, so the pre-restore ledger is carried across the swap: every
    /// backup known before the restore (including the one being restored)
    /// stays listed and verifiable afterwards.
    pub fn restore_backup(
        &self,
        backup_id: &str,
        verify_integrity: bool,
    ) -> Result<bool, BackupError> {
        let (record, preserved) = {
            let conn = self.conn.lock();
            let record = ledger::get_backup_record(&conn, backup_id)?
                .ok_or_else(|| BackupError::NotFound(backup_id.to_string()))?;
            let preserved = ledger::list_backup_records(&conn)?;
            (record, preserved)
        };

        if verify_integrity && !self.verify_backup_integrity(backup_id)? {
            warn!("refusing to restore {backup_id}: integrity verification failed");
            return Ok(false);
        }

        let db_dir = self
            .config
            .db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut staged = NamedTempFile::new_in(&db_dir)?;
        backup::unpack_snapshot(&record.file_path, staged.as_file_mut(), record.compression)?;
        staged.as_file_mut().sync_all()?;

        let mut conn = self.conn.lock();
        // Drop stale WAL/SHM siblings of the file being replaced while the
        // live connection is still attached: a failure here leaves the
        // manager untouched.
        for suffix in ["-wal", "-shm"] {
            let side = side_file(&self.config.db_path, suffix);
            if side.exists() {
                fs::remove_file(&side)?;
            }
        }

        // Close the live connection before the file underneath it changes.
        *conn = Connection::open_in_memory()?;
        match swap_in_snapshot(&self.config.db_path, staged, &preserved) {
            Ok(reopened) => {
                *conn = reopened;
                info!("restored database {:?} from backup {backup_id}", self.config.db_path);
                Ok(true)
            }
            Err(err) => {
                // Reattach to whatever is on disk (the untouched live file,
                // or the snapshot if the rename already happened) so a
                // failed restore leaves the manager usable.
                match open_database(&self.config.db_path) {
                    Ok(fallback) => *conn = fallback,
                    Err(reopen_err) => {
                        error!("could not reopen {:?} after failed restore: {reopen_err}",
                            self.config.db_path);
                    }
                }
                Err(err)
            }
        }
    }

    /// Remove a backup's ledger row and file. Idempotent: returns `false`
    /// when the record is already absent. The row goes first, so a failed
    /// file removal leaves an orphaned file but never a record pointing at
    /// a destroyed one.
    pub fn delete_backup(&self, backup_id: &str) -> Result<bool, BackupError> {
        let conn = self.conn.lock();
        let Some(record) = ledger::get_backup_record(&conn, backup_id)? else {
            return Ok(false);
        };
        ledger::delete_backup_record(&conn, backup_id)?;
        if record.file_path.exists() {
            fs::remove_file(&record.file_path)?;
        }
        info!("deleted backup {backup_id}");
        Ok(true)
    }

    /// All recorded backups ordered by creation time, most recent last.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>, BackupError> {
        let conn = self.conn.lock();
        Ok(ledger::list_backup_records(&conn)?)
    }

    pub fn get_backup_info(&self, backup_id: &str) -> Result<Option<BackupRecord>, BackupError> {
        let conn = self.conn.lock();
        Ok(ledger::get_backup_record(&conn, backup_id)?)
    }

    /// Delete backups older than `keep_days` days that are not among the
    /// `keep_count` most recently created. Returns how many were deleted.
    /// `keep_days = 0` degenerates to pure keep-last-N retention.
    pub fn cleanup_old_backups(
        &self,
        keep_days: u32,
        keep_count: usize,
    ) -> Result<usize, BackupError> {
        let mut records = self.list_backups()?;
        records.reverse(); // most recent first for the retention window
        let victims = backup::retention_victims(&records, keep_days, keep_count, Utc::now());

        let mut deleted = 0;
        for backup_id in &victims {
            match self.delete_backup(backup_id) {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(err) => {
                    error!("cleanup failed to delete backup {backup_id}: {err}");
                    return Err(err);
                }
            }
        }
        if deleted > 0 {
            info!("retention cleanup removed {deleted} backups");
        }
        Ok(deleted)
    }
}
