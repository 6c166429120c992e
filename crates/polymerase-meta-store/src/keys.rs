//! Catalog key encoding
//!
//! A backup is addressed by two independent encodings of the same
//! `(db, base, backup)` triple:
//!
//! - the storage key `escape(db)/base/backup`, used as the artifact's
//!   relative directory and handed to clients;
//! - the metadata key `meta-backup-` + `u32_be(len(db))` + `db` + `base` +
//!   `backup`, used in the KV store. The length prefix keeps the raw
//!   database id prefix-safe and the time points are fixed width, so a
//!   prefix scan over `(db)` or `(db, base)` never leaks into another
//!   database or lineage.
//!
//! Each encoding converts exactly into the other.

use polymerase_common::{
    BackupKey, DatabaseId, Error, NodeId, Result, TIME_POINT_LEN, TimePoint,
};

/// Namespace of backup records
pub const META_BACKUP_PREFIX: &[u8] = b"meta-backup-";

/// Namespace of node records
pub const META_NODE_PREFIX: &[u8] = b"meta-node-";

/// Namespace of lineage locks
pub const LOCK_PREFIX: &[u8] = b"lock-";

const DB_LEN_BYTES: usize = 4;

/// Escape a database id for use as a single path component
///
/// `.` and `..` are spelled `%2E` and `%2E%2E` so they never name the
/// current or parent directory.
#[must_use]
pub fn escape_db(db: &str) -> String {
    if db == "." || db == ".." {
        return "%2E".repeat(db.len());
    }
    let mut out = String::with_capacity(db.len());
    for c in db.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape_db`]
pub fn unescape_db(escaped: &str) -> Result<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("%25") {
            out.push('%');
        } else if tail.starts_with("%2F") {
            out.push('/');
        } else if tail.starts_with("%2E") {
            out.push('.');
        } else {
            return Err(Error::key_decode(format!(
                "invalid escape sequence in {escaped:?}"
            )));
        }
        rest = &tail[3..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Storage key of a backup: `escape(db)/base/backup`
#[must_use]
pub fn storage_key(key: &BackupKey) -> String {
    format!(
        "{}/{}/{}",
        escape_db(key.db.as_str()),
        key.base,
        key.backup
    )
}

/// Decode a storage key
pub fn parse_storage_key(s: &str) -> Result<BackupKey> {
    let mut parts = s.split('/');
    let (Some(db), Some(base), Some(backup), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::key_decode(format!(
            "storage key {s:?} must have three components"
        )));
    };
    let db = DatabaseId::new(unescape_db(db)?)
        .map_err(|_| Error::key_decode(format!("storage key {s:?} has an empty db")))?;
    Ok(BackupKey::new(
        db,
        TimePoint::parse(base)?,
        TimePoint::parse(backup)?,
    ))
}

/// Metadata key prefix covering every backup of `db`
#[must_use]
pub fn db_prefix(db: &DatabaseId) -> Vec<u8> {
    let raw = db.as_bytes();
    let mut key = Vec::with_capacity(META_BACKUP_PREFIX.len() + DB_LEN_BYTES + raw.len());
    key.extend_from_slice(META_BACKUP_PREFIX);
    // DatabaseId::new caps the length at u32::MAX
    key.extend_from_slice(&u32::try_from(raw.len()).unwrap_or(u32::MAX).to_be_bytes());
    key.extend_from_slice(raw);
    key
}

/// Metadata key prefix covering one lineage
#[must_use]
pub fn lineage_prefix(db: &DatabaseId, base: &TimePoint) -> Vec<u8> {
    let mut key = db_prefix(db);
    key.extend_from_slice(base.as_bytes());
    key
}

/// Metadata key of a backup record
#[must_use]
pub fn meta_key(key: &BackupKey) -> Vec<u8> {
    let mut raw = lineage_prefix(&key.db, &key.base);
    raw.extend_from_slice(key.backup.as_bytes());
    raw
}

/// Decode a metadata key
pub fn parse_meta_key(raw: &[u8]) -> Result<BackupKey> {
    let lossy = || String::from_utf8_lossy(raw).into_owned();
    let rest = raw
        .strip_prefix(META_BACKUP_PREFIX)
        .ok_or_else(|| Error::key_decode(format!("{:?} is not a backup key", lossy())))?;
    if rest.len() < DB_LEN_BYTES {
        return Err(Error::key_decode(format!("{:?} is truncated", lossy())));
    }
    let (len, rest) = rest.split_at(DB_LEN_BYTES);
    let mut len_bytes = [0u8; DB_LEN_BYTES];
    len_bytes.copy_from_slice(len);
    let db_len = u32::from_be_bytes(len_bytes) as usize;
    if rest.len() != db_len + 2 * TIME_POINT_LEN {
        return Err(Error::key_decode(format!(
            "{:?} has wrong length for a db of {db_len} bytes",
            lossy()
        )));
    }
    let (db, times) = rest.split_at(db_len);
    let (base, backup) = times.split_at(TIME_POINT_LEN);

    let text = |b: &[u8]| {
        std::str::from_utf8(b)
            .map(str::to_owned)
            .map_err(|_| Error::key_decode(format!("{:?} is not utf-8", lossy())))
    };
    let db = DatabaseId::new(text(db)?)
        .map_err(|_| Error::key_decode(format!("{:?} has an empty db", lossy())))?;
    Ok(BackupKey::new(
        db,
        TimePoint::parse(&text(base)?)?,
        TimePoint::parse(&text(backup)?)?,
    ))
}

/// Convert a storage key into its metadata key
pub fn storage_key_to_meta_key(s: &str) -> Result<Vec<u8>> {
    parse_storage_key(s).map(|k| meta_key(&k))
}

/// Convert a metadata key into its storage key
pub fn meta_key_to_storage_key(raw: &[u8]) -> Result<String> {
    parse_meta_key(raw).map(|k| storage_key(&k))
}

/// Name of the lock serializing read-modify-write on one lineage
#[must_use]
pub fn lineage_lock_key(db: &DatabaseId, base: &TimePoint) -> Vec<u8> {
    let mut key = LOCK_PREFIX.to_vec();
    key.extend_from_slice(&lineage_prefix(db, base));
    key
}

/// Key of a node record
#[must_use]
pub fn node_key(node_id: &NodeId) -> Vec<u8> {
    let mut key = META_NODE_PREFIX.to_vec();
    key.extend_from_slice(node_id.as_str().as_bytes());
    key
}
