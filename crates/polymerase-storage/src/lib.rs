//! Polymerase backup storage
//!
//! This crate holds everything a node does with backup artifacts:
//! - On-disk layout, temp artifacts and relocation ([`disk`])
//! - Incremental chain resolution over the catalog ([`chain`])
//! - Inbound transfer sessions ([`transfer`])
//! - Restore lookups, retention, streaming and catalog rebuild ([`manager`])

pub mod chain;
pub mod disk;
pub mod manager;
pub mod transfer;

pub use chain::ChainResolver;
pub use disk::{
    ArtifactReader, ArtifactWriter, DiskStorage, DiskUsage, PhysicalStorage, StoredArtifact,
    TempArtifact,
};
pub use manager::{
    BackupManager, LocalNode, ManagerOptions, NOTHING_TO_PURGE, PURGE_SUCCEEDED, RebuildReport,
};
pub use transfer::{
    SessionPhase, TransferContext, TransferReply, TransferRequest, TransferSession, run_transfer,
};
