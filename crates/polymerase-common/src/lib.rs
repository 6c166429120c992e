//! Polymerase Common - Shared types and utilities
//!
//! This crate provides the identifiers, catalog records, error taxonomy
//! and configuration structures used across all Polymerase components.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod types;

pub use checkpoint::Checkpoints;
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
