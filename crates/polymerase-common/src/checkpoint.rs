//! Checkpoint manifest parsing
//!
//! The backup producer emits a small `key = value` file describing the LSN
//! range of the artifact it just wrote. It travels in-stream or is posted
//! out-of-band and ends up attached to the catalog record.

use crate::error::{Error, Result};
use crate::types::BackupType;
use ini::Ini;
use serde::{Deserialize, Serialize};

/// File name of the manifest stored next to each artifact
pub const CHECKPOINTS_FILE_NAME: &str = "xtrabackup_checkpoints";

/// Parsed checkpoint manifest
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoints {
    /// Raw `backup_type` tag as written by the producer
    pub backup_type: String,
    pub from_lsn: String,
    pub to_lsn: String,
    pub last_lsn: String,
    pub compact: bool,
    pub recover_binlog_info: bool,
}

impl Checkpoints {
    /// Parse manifest bytes
    ///
    /// The manifest is INI without sections; keys under a `[section]`
    /// header are not read. Unknown keys are ignored.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| Error::validation(format!("checkpoint manifest is not utf-8: {e}")))?;
        let conf = Ini::load_from_str(text)
            .map_err(|e| Error::validation(format!("checkpoint manifest: {e}")))?;
        let general = conf.general_section();
        let field = |key: &str| general.get(key).unwrap_or_default().trim().to_string();

        Ok(Self {
            backup_type: field("backup_type"),
            from_lsn: field("from_lsn"),
            to_lsn: field("to_lsn"),
            last_lsn: field("last_lsn"),
            compact: parse_flag("compact", general.get("compact"))?,
            recover_binlog_info: parse_flag("recover_binlog_info", general.get("recover_binlog_info"))?,
        })
    }

    /// Keys the producer always writes but this manifest lacks
    #[must_use]
    pub fn missing_required(&self) -> Vec<&'static str> {
        [
            ("backup_type", &self.backup_type),
            ("from_lsn", &self.from_lsn),
            ("to_lsn", &self.to_lsn),
            ("last_lsn", &self.last_lsn),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_empty())
        .map(|(k, _)| k)
        .collect()
    }

    /// Backup type implied by the producer's tag, if recognised
    #[must_use]
    pub fn backup_type_hint(&self) -> Option<BackupType> {
        match self.backup_type.as_str() {
            "full-backuped" | "full-prepared" => Some(BackupType::Full),
            "incremental" => Some(BackupType::Incremental),
            _ => None,
        }
    }

    /// Render back into manifest form
    #[must_use]
    pub fn to_manifest(&self) -> String {
        format!(
            "backup_type = {}\nfrom_lsn = {}\nto_lsn = {}\nlast_lsn = {}\ncompact = {}\nrecover_binlog_info = {}\n",
            self.backup_type,
            self.from_lsn,
            self.to_lsn,
            self.last_lsn,
            u8::from(self.compact),
            u8::from(self.recover_binlog_info),
        )
    }
}

fn parse_flag(key: &str, value: Option<&str>) -> Result<bool> {
    let Some(value) = value.map(str::trim) else {
        return Ok(false);
    };
    value
        .parse::<i64>()
        .map(|v| v != 0)
        .map_err(|_| Error::validation(format!("checkpoint manifest: {key} must be an integer, got {value:?}")))
}
