//! Snapshot primitives for the backup subsystem: streaming SHA-256 over the
//! uncompressed database bytes, gzip encode/decode, backup id derivation, and
//! retention eligibility.
//!
//! The integrity checksum is always computed over canonical (uncompressed)
//! bytes, so compression can be toggled without invalidating existing
//! integrity metadata.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ledger::BackupRecord;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Backup not found: {0}")]
    NotFound(String),
    #[error("Invalid backup type tag: {0:?}")]
    InvalidTypeTag(String),
}

const HASH_BUF_SIZE: usize = 65536;

/// The tag becomes part of the backup filename, so it is restricted to
/// filesystem-safe characters.
pub(crate) fn validate_type_tag(tag: &str) -> Result<(), BackupError> {
    let safe = !tag.is_empty()
        && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !safe {
        return Err(BackupError::InvalidTypeTag(tag.to_string()));
    }
    Ok(())
}

/// Time-derived backup id: `backup_<YYYYmmdd_HHMMSS_micros>_<type>`.
pub(crate) fn derive_backup_id(created_at: DateTime<Utc>, backup_type: &str) -> String {
    format!("backup_{}_{}", created_at.format("%Y%m%d_%H%M%S_%6f"), backup_type)
}

pub(crate) fn backup_filename(backup_id: &str, compression: bool) -> String {
    if compression {
        format!("{backup_id}.db.gz")
    } else {
        format!("{backup_id}.db")
    }
}

fn copy_hashed<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    hasher: &mut Sha256,
) -> io::Result<()> {
    let mut buffer = [0u8; HASH_BUF_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        writer.write_all(&buffer[..n])?;
    }
    writer.flush()
}

fn hash_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUF_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Copy `src` into `dst`, gzip-compressed if requested, hashing the
/// uncompressed bytes as they stream through. Returns the hex digest of the
/// source bytes and the size of the written file.
pub(crate) fn write_snapshot(
    src: &Path,
    dst: &Path,
    compression: bool,
) -> Result<(String, u64), BackupError> {
    let mut reader = File::open(src)?;
    let mut hasher = Sha256::new();

    if compression {
        let mut encoder = GzEncoder::new(File::create(dst)?, Compression::default());
        copy_hashed(&mut reader, &mut encoder, &mut hasher)?;
        encoder.finish()?;
    } else {
        let mut out = File::create(dst)?;
        copy_hashed(&mut reader, &mut out, &mut hasher)?;
    }

    let size_bytes = std::fs::metadata(dst)?.len();
    Ok((format!("{:x}", hasher.finalize()), size_bytes))
}

/// Recompute the checksum of a stored snapshot's canonical bytes,
/// decompressing on the fly if the snapshot is gzip-compressed.
pub(crate) fn snapshot_checksum(path: &Path, compression: bool) -> Result<String, BackupError> {
    let mut file = File::open(path)?;
    let checksum = if compression {
        hash_reader(&mut GzDecoder::new(file))?
    } else {
        hash_reader(&mut file)?
    };
    Ok(checksum)
}

/// Stream a stored snapshot's canonical bytes into `dst` (the write side of
/// restore).
pub(crate) fn unpack_snapshot<W: Write>(
    src: &Path,
    dst: &mut W,
    compression: bool,
) -> Result<(), BackupError> {
    let file = File::open(src)?;
    if compression {
        let mut decoder = GzDecoder::new(file);
        io::copy(&mut decoder, dst)?;
    } else {
        let mut reader = file;
        io::copy(&mut reader, dst)?;
    }
    dst.flush()?;
    Ok(())
}

/// Ids eligible for retention cleanup: strictly older than `keep_days` days
/// AND outside the `keep_count` most recently created. `records` must be
/// sorted most recent first. With `keep_days = 0` the age check always
/// passes, leaving pure keep-last-N retention.
pub(crate) fn retention_victims(
    records: &[BackupRecord],
    keep_days: u32,
    keep_count: usize,
    now: DateTime<Utc>,
) -> Vec<String> {
    let cutoff = now - Duration::days(i64::from(keep_days));
    records
        .iter()
        .skip(keep_count)
        .filter(|record| record.created_at < cutoff)
        .map(|record| record.backup_id.clone())
        .collect()
}
