//! Polymerase Protocol - gRPC service definitions
//!
//! This crate contains the protobuf-generated code for the backup service
//! spoken between backup producers, restore tooling and storage nodes.

/// Backup service (transfer, restore lookups, retention)
pub mod backup {
    tonic::include_proto!("polymerase.backup");
}
