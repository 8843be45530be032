//! Backup, verify, restore, and retention behavior end to end.

mod common;

use common::CreateTable;
use dbvault::{BackupError, MigrationScript};
use std::fs::{self, OpenOptions};
use tempfile::TempDir;

fn one_table() -> Vec<Box<dyn MigrationScript>> {
    vec![Box::new(CreateTable { version: "001", table: "notes" })]
}

#[test]
fn test_compressed_backup_round_trips_byte_for_byte() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());
    manager.migrate(false).unwrap();

    let backup_id = manager.create_backup("test", true).unwrap();
    assert!(manager.verify_backup_integrity(&backup_id).unwrap());

    let record = manager.get_backup_info(&backup_id).unwrap().unwrap();
    assert!(record.compression);
    assert!(record.filename.ends_with(".db.gz"));
    assert!(record.file_path.exists());
    assert!(record.size_bytes > 0);

    let before = fs::read(&manager.config().db_path).unwrap();
    assert!(manager.restore_backup(&backup_id, true).unwrap());
    let after = fs::read(&manager.config().db_path).unwrap();
    assert_eq!(before, after);

    // The snapshot is still usable after the restore.
    assert!(manager.verify_backup_integrity(&backup_id).unwrap());
    assert_eq!(manager.get_current_version().unwrap(), "001");
}

#[test]
fn test_uncompressed_backup_round_trips() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());
    manager.migrate(false).unwrap();

    let backup_id = manager.create_backup("manual", false).unwrap();
    let record = manager.get_backup_info(&backup_id).unwrap().unwrap();
    assert!(!record.compression);
    assert!(record.filename.ends_with(".db"));

    assert!(manager.verify_backup_integrity(&backup_id).unwrap());
    assert!(manager.restore_backup(&backup_id, true).unwrap());
    assert!(common::table_exists(&manager, "notes"));
}

#[test]
fn test_verify_detects_truncation() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());
    manager.migrate(false).unwrap();

    let backup_id = manager.create_backup("test", false).unwrap();
    let record = manager.get_backup_info(&backup_id).unwrap().unwrap();

    let file = OpenOptions::new().write(true).open(&record.file_path).unwrap();
    file.set_len(record.size_bytes / 2).unwrap();
    drop(file);

    assert!(!manager.verify_backup_integrity(&backup_id).unwrap());

    // Guarded restore refuses and leaves the live database alone.
    let before = fs::read(&manager.config().db_path).unwrap();
    assert!(!manager.restore_backup(&backup_id, true).unwrap());
    let after = fs::read(&manager.config().db_path).unwrap();
    assert_eq!(before, after);
    assert_eq!(manager.get_current_version().unwrap(), "001");
}

#[test]
fn test_verify_detects_bit_flip_in_compressed_snapshot() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());
    manager.migrate(false).unwrap();

    let backup_id = manager.create_backup("test", true).unwrap();
    let record = manager.get_backup_info(&backup_id).unwrap().unwrap();

    let mut bytes = fs::read(&record.file_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&record.file_path, &bytes).unwrap();

    // Either the gzip stream no longer decodes or the digest changed;
    // both report as an integrity failure rather than an error.
    assert!(!manager.verify_backup_integrity(&backup_id).unwrap());
}

#[test]
fn test_verify_reports_false_for_missing_file_and_unknown_id() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());

    let backup_id = manager.create_backup("test", false).unwrap();
    let record = manager.get_backup_info(&backup_id).unwrap().unwrap();
    fs::remove_file(&record.file_path).unwrap();

    assert!(!manager.verify_backup_integrity(&backup_id).unwrap());
    assert!(!manager.verify_backup_integrity("no_such_backup").unwrap());
}

#[test]
fn test_restore_preserves_backup_ledger() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());
    manager.migrate(false).unwrap();

    let first = manager.create_backup("test", false).unwrap();
    let second = manager.create_backup("test", true).unwrap();
    assert!(manager.delete_backup(&first).unwrap());

    // Restoring rewinds the schema, not the backup ledger: the restored
    // snapshot predates both backups, yet the surviving one stays known.
    assert!(manager.restore_backup(&second, true).unwrap());

    let listed: Vec<String> =
        manager.list_backups().unwrap().into_iter().map(|r| r.backup_id).collect();
    assert_eq!(listed, vec![second.clone()]);
    assert!(manager.get_backup_info(&first).unwrap().is_none());
    assert!(manager.verify_backup_integrity(&second).unwrap());

    // And a backup taken after the restore coexists with the carried rows.
    let third = manager.create_backup("test", false).unwrap();
    assert_eq!(manager.list_backups().unwrap().len(), 2);
    assert!(manager.verify_backup_integrity(&third).unwrap());
}

#[test]
fn test_failed_restore_keeps_manager_attached_to_live_db() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());
    manager.migrate(false).unwrap();
    let backup_id = manager.create_backup("test", true).unwrap();

    // Squat the WAL sibling path with a directory so the restore cannot
    // clear it.
    let mut wal = manager.config().db_path.clone().into_os_string();
    wal.push("-wal");
    let wal = std::path::PathBuf::from(wal);
    if wal.exists() {
        fs::remove_file(&wal).unwrap();
    }
    fs::create_dir(&wal).unwrap();

    assert!(manager.restore_backup(&backup_id, true).is_err());

    // The live database was not replaced and the manager still works.
    assert_eq!(manager.get_current_version().unwrap(), "001");
    assert!(common::table_exists(&manager, "notes"));
    assert_eq!(manager.list_backups().unwrap().len(), 1);

    // Clearing the obstruction makes the same restore succeed.
    fs::remove_dir(&wal).unwrap();
    assert!(manager.restore_backup(&backup_id, true).unwrap());
    assert_eq!(manager.get_current_version().unwrap(), "001");
}

#[test]
fn test_restore_unknown_id_is_an_error() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());

    let err = manager.restore_backup("no_such_backup", true).err().unwrap();
    assert!(matches!(err, BackupError::NotFound(_)));
}

#[test]
fn test_backup_type_tag_is_validated() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());

    let err = manager.create_backup("../evil", true).err().unwrap();
    assert!(matches!(err, BackupError::InvalidTypeTag(_)));
    assert!(manager.create_backup("pre_migration", false).is_ok());
    assert!(manager.create_backup("nightly-2", false).is_ok());
}

#[test]
fn test_delete_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());

    let backup_id = manager.create_backup("test", false).unwrap();
    let record = manager.get_backup_info(&backup_id).unwrap().unwrap();
    assert!(record.file_path.exists());

    assert!(manager.delete_backup(&backup_id).unwrap());
    assert!(!record.file_path.exists());
    assert!(manager.get_backup_info(&backup_id).unwrap().is_none());

    // Second delete finds nothing and says so without failing.
    assert!(!manager.delete_backup(&backup_id).unwrap());
}

#[test]
fn test_delete_clears_ledger_row_before_file() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());

    let backup_id = manager.create_backup("test", false).unwrap();
    let record = manager.get_backup_info(&backup_id).unwrap().unwrap();

    // Make the file undeletable by replacing it with a non-empty directory.
    fs::remove_file(&record.file_path).unwrap();
    fs::create_dir(&record.file_path).unwrap();
    fs::write(record.file_path.join("occupant"), b"x").unwrap();

    assert!(manager.delete_backup(&backup_id).is_err());

    // The ledger row is already gone, so nothing points at the wreckage;
    // the undeletable path is left behind as an orphan.
    assert!(manager.get_backup_info(&backup_id).unwrap().is_none());
    assert!(record.file_path.exists());
}

#[test]
fn test_delete_tolerates_already_missing_file() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());

    let backup_id = manager.create_backup("test", false).unwrap();
    let record = manager.get_backup_info(&backup_id).unwrap().unwrap();
    fs::remove_file(&record.file_path).unwrap();

    assert!(manager.delete_backup(&backup_id).unwrap());
    assert!(manager.list_backups().unwrap().is_empty());
}

#[test]
fn test_cleanup_keeps_the_newest_snapshots() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(manager.create_backup("test", false).unwrap());
    }
    assert_eq!(manager.list_backups().unwrap().len(), 5);

    // keep_days = 0 makes every backup age-eligible, so only keep_count
    // protects the newest three.
    let removed = manager.cleanup_old_backups(0, 3).unwrap();
    assert_eq!(removed, 2);

    let remaining: Vec<String> =
        manager.list_backups().unwrap().into_iter().map(|r| r.backup_id).collect();
    assert_eq!(remaining, ids[2..].to_vec());
    for id in &ids[..2] {
        assert!(manager.get_backup_info(id).unwrap().is_none());
    }
}

#[test]
fn test_cleanup_spares_recent_backups_regardless_of_count() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());

    for _ in 0..4 {
        manager.create_backup("test", false).unwrap();
    }

    // Everything was created just now, so a 30-day window removes nothing
    // even with keep_count = 0.
    let removed = manager.cleanup_old_backups(30, 0).unwrap();
    assert_eq!(removed, 0);
    assert_eq!(manager.list_backups().unwrap().len(), 4);
}

#[test]
fn test_list_backups_is_oldest_first() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());

    let first = manager.create_backup("test", false).unwrap();
    let second = manager.create_backup("test", true).unwrap();

    let listed: Vec<String> =
        manager.list_backups().unwrap().into_iter().map(|r| r.backup_id).collect();
    assert_eq!(listed, vec![first, second]);
}

#[test]
fn test_migrate_with_backup_records_safety_snapshot() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());

    let report = manager.migrate(true).unwrap();
    assert!(report.is_success());
    let backup_id = report.backup_id.unwrap();

    let record = manager.get_backup_info(&backup_id).unwrap().unwrap();
    assert_eq!(record.backup_type, "pre_migration");
    assert!(manager.verify_backup_integrity(&backup_id).unwrap());
}

#[test]
fn test_rollback_with_backup_records_safety_snapshot() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());
    manager.migrate(false).unwrap();

    let report = manager.rollback("000", true).unwrap();
    assert!(report.is_success());
    let backup_id = report.backup_id.unwrap();

    let record = manager.get_backup_info(&backup_id).unwrap().unwrap();
    assert_eq!(record.backup_type, "pre_rollback");
}

#[test]
fn test_restore_rewinds_a_rollback() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());
    manager.migrate(false).unwrap();

    let backup_id = manager.create_backup("checkpoint", true).unwrap();

    manager.rollback("000", false).unwrap();
    assert_eq!(manager.get_current_version().unwrap(), "000");
    assert!(!common::table_exists(&manager, "notes"));

    assert!(manager.restore_backup(&backup_id, true).unwrap());
    assert_eq!(manager.get_current_version().unwrap(), "001");
    assert!(common::table_exists(&manager, "notes"));

    // The manager is fully usable after the restore swap.
    let rollback = manager.rollback("000", false).unwrap();
    assert!(rollback.is_success());
    assert_eq!(manager.get_current_version().unwrap(), "000");
}

#[test]
fn test_stats_count_backups() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager_with(&dir, one_table());
    manager.migrate(false).unwrap();
    manager.create_backup("test", false).unwrap();
    manager.create_backup("test", true).unwrap();

    let stats = manager.get_database_stats().unwrap();
    assert_eq!(stats.backup_count, 2);
    assert_eq!(stats.current_version, "001");
    assert!(stats.tables.iter().any(|t| t.name == "notes"));
}
