//! Core type definitions for Polymerase
//!
//! This module defines the identifiers, time points and catalog records
//! shared by the transfer service, the chain resolver and the allocator.

use crate::checkpoint::Checkpoints;
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Layout of an encoded [`TimePoint`]
pub const TIME_POINT_FORMAT: &str = "%Y-%m-%d_%H-%M-%S_%z";

/// Byte length of every encoded [`TimePoint`]
pub const TIME_POINT_LEN: usize = 25;

/// Identifier of a logical database
///
/// May contain `/`; key encodings escape it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct DatabaseId(String);

impl DatabaseId {
    /// Create a database id, rejecting the empty string
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::validation("empty db is not acceptable"));
        }
        if u32::try_from(id.len()).is_err() {
            return Err(Error::validation("db id is too long"));
        }
        Ok(Self(id))
    }

    /// Get the database id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the raw bytes of the database id
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatabaseId({:?})", self.0)
    }
}

/// Identifier of a cluster member
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id, rejecting the empty string
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::validation("empty node id is not acceptable"));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:?})", self.0)
    }
}

/// Fixed-width, byte-sortable timestamp (`2017-12-08_22-29-28_+0000`)
///
/// Always rendered in UTC, so byte order equals chronological order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
#[display("{_0}")]
pub struct TimePoint(String);

impl TimePoint {
    /// Encode a UTC timestamp (sub-second precision is dropped)
    #[must_use]
    pub fn from_datetime(t: DateTime<Utc>) -> Self {
        Self(t.format(TIME_POINT_FORMAT).to_string())
    }

    /// Time point of the current instant
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Parse an encoded time point; only the canonical UTC form is accepted
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != TIME_POINT_LEN {
            return Err(Error::key_decode(format!(
                "time point {s:?} must be {TIME_POINT_LEN} bytes"
            )));
        }
        let t = DateTime::parse_from_str(s, TIME_POINT_FORMAT)
            .map_err(|e| Error::key_decode(format!("time point {s:?}: {e}")))?
            .with_timezone(&Utc);
        let tp = Self::from_datetime(t);
        if tp.0 != s {
            return Err(Error::key_decode(format!("time point {s:?} is not in UTC")));
        }
        Ok(tp)
    }

    /// Decode back into a timestamp
    pub fn to_datetime(&self) -> Result<DateTime<Utc>> {
        DateTime::parse_from_str(&self.0, TIME_POINT_FORMAT)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::key_decode(format!("time point {:?}: {e}", self.0)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimePoint({})", self.0)
    }
}

impl TryFrom<String> for TimePoint {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<TimePoint> for String {
    fn from(tp: TimePoint) -> Self {
        tp.0
    }
}

/// Parse a restore point sent by restore tooling
///
/// Accepts RFC 3339, an encoded [`TimePoint`], or a calendar date
/// (`2017-12-08`), which means the last instant of that day.
pub fn parse_restore_point(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(tp) = TimePoint::parse(s) {
        return tp.to_datetime();
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| Error::validation(format!("cannot parse restore point {s:?}")))?;
    let end_of_day = NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999)
        .ok_or_else(|| Error::internal("invalid end-of-day time"))?;
    Ok(date.and_time(end_of_day).and_utc())
}

/// Kind of backup artifact
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupType {
    /// Physical full backup, the root of a lineage
    Full,
    /// Physical incremental backup applied on top of its predecessor
    Incremental,
    /// Logical dump; carries no LSN range
    LogicalDump,
}

impl BackupType {
    /// File name of the artifact inside its storage directory
    #[must_use]
    pub const fn artifact_name(self) -> &'static str {
        match self {
            Self::Full => "base.tar.gz",
            Self::Incremental => "inc.xb.gz",
            Self::LogicalDump => "dump.sql.gz",
        }
    }

    /// Recognise an artifact by its file name
    #[must_use]
    pub fn from_artifact_name(name: &str) -> Option<Self> {
        [Self::Full, Self::Incremental, Self::LogicalDump]
            .into_iter()
            .find(|t| t.artifact_name() == name)
    }

    /// Physical backups take part in LSN chains
    #[must_use]
    pub const fn is_physical(self) -> bool {
        matches!(self, Self::Full | Self::Incremental)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::LogicalDump => "logical-dump",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" | "inc" => Ok(Self::Incremental),
            "logical-dump" | "dump" => Ok(Self::LogicalDump),
            other => Err(Error::validation(format!("unknown backup type {other:?}"))),
        }
    }
}

/// What a producer asks to store, checked once at session start
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupRequest {
    Full,
    /// Continue the lineage whose latest backup ended at `lsn`
    Incremental { lsn: String },
    LogicalDump,
}

impl BackupRequest {
    /// Build a request; `lsn` is required for incrementals and rejected otherwise
    pub fn new(backup_type: BackupType, lsn: Option<String>) -> Result<Self> {
        let lsn = lsn.filter(|l| !l.is_empty());
        match (backup_type, lsn) {
            (BackupType::Incremental, Some(lsn)) => Ok(Self::Incremental { lsn }),
            (BackupType::Incremental, None) => {
                Err(Error::validation("empty lsn is not acceptable"))
            }
            (BackupType::Full, None) => Ok(Self::Full),
            (BackupType::LogicalDump, None) => Ok(Self::LogicalDump),
            (t, Some(_)) => Err(Error::validation(format!(
                "lsn is only accepted for incremental backups, not {t}"
            ))),
        }
    }

    #[must_use]
    pub const fn backup_type(&self) -> BackupType {
        match self {
            Self::Full => BackupType::Full,
            Self::Incremental { .. } => BackupType::Incremental,
            Self::LogicalDump => BackupType::LogicalDump,
        }
    }
}

/// Where an artifact is physically kept
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    #[default]
    Local,
}

impl StorageType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
        }
    }
}

/// Identity of one backup artifact: `(db, base time point, backup time point)`
///
/// `base` names the lineage; `backup == base` for the lineage's full backup.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackupKey {
    pub db: DatabaseId,
    pub base: TimePoint,
    pub backup: TimePoint,
}

impl BackupKey {
    #[must_use]
    pub const fn new(db: DatabaseId, base: TimePoint, backup: TimePoint) -> Self {
        Self { db, base, backup }
    }

    /// Key of a lineage root
    #[must_use]
    pub fn root(db: DatabaseId, at: TimePoint) -> Self {
        Self {
            db,
            base: at.clone(),
            backup: at,
        }
    }
}

impl fmt::Display for BackupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.db, self.base, self.backup)
    }
}

/// Catalog record persisted once per [`BackupKey`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    pub key: BackupKey,
    pub backup_type: BackupType,
    /// LSN this backup starts from; for incrementals, the predecessor's `to_lsn`
    pub from_lsn: Option<String>,
    /// LSN this backup ends at; unset until the producer's manifest is known
    pub to_lsn: Option<String>,
    pub stored_time: DateTime<Utc>,
    pub file_size: u64,
    pub storage_type: StorageType,
    pub host_addr: String,
    pub node_id: NodeId,
    pub checkpoints: Option<Checkpoints>,
}

impl BackupMeta {
    #[must_use]
    pub const fn db(&self) -> &DatabaseId {
        &self.key.db
    }

    #[must_use]
    pub const fn base_time_point(&self) -> &TimePoint {
        &self.key.base
    }

    #[must_use]
    pub const fn backup_time_point(&self) -> &TimePoint {
        &self.key.backup
    }

    /// Chronological order: `stored_time`, then key for equal times
    #[must_use]
    pub fn chronological_cmp(&self, other: &Self) -> Ordering {
        self.stored_time
            .cmp(&other.stored_time)
            .then_with(|| self.key.cmp(&other.key))
    }

    /// Sort records oldest first
    pub fn sort_chronologically(metas: &mut [Self]) {
        metas.sort_by(Self::chronological_cmp);
    }

    /// Attach a checkpoint manifest, filling LSNs that are still unset
    ///
    /// Returns `Ok(false)` when the identical manifest is already attached.
    /// LSNs and the backup type never change once recorded.
    pub fn backfill_checkpoints(&mut self, cp: Checkpoints) -> Result<bool> {
        if let Some(existing) = &self.checkpoints {
            if *existing == cp {
                return Ok(false);
            }
            return Err(Error::validation(format!(
                "checkpoints of {} are already recorded",
                self.key
            )));
        }
        if let Some(hint) = cp.backup_type_hint()
            && hint != self.backup_type
        {
            return Err(Error::validation(format!(
                "manifest describes a {hint} backup but {} is {}",
                self.key, self.backup_type
            )));
        }
        if self.backup_type.is_physical() {
            check_lsn(&self.key, "from_lsn", self.from_lsn.as_deref(), &cp.from_lsn)?;
            check_lsn(&self.key, "to_lsn", self.to_lsn.as_deref(), &cp.to_lsn)?;
            if self.from_lsn.is_none() && !cp.from_lsn.is_empty() {
                self.from_lsn = Some(cp.from_lsn.clone());
            }
            if self.to_lsn.is_none() && !cp.to_lsn.is_empty() {
                self.to_lsn = Some(cp.to_lsn.clone());
            }
        }
        self.checkpoints = Some(cp);
        Ok(true)
    }
}

fn check_lsn(key: &BackupKey, field: &str, recorded: Option<&str>, manifest: &str) -> Result<()> {
    match recorded {
        Some(cur) if !manifest.is_empty() && cur != manifest => Err(Error::validation(format!(
            "{field} of {key} is fixed at {cur}, manifest says {manifest}"
        ))),
        _ => Ok(()),
    }
}

/// Capacity record of a cluster member
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub node_id: NodeId,
    pub advertise_addr: String,
    pub store_dir_path: String,
    pub disk_total_bytes: u64,
    pub disk_avail_bytes: u64,
}
