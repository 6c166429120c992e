//! Polymerase Metadata Store - backup catalog over a consistent KV store
//!
//! The catalog is a thin typed layer ([`MetadataStore`]) over an abstract
//! key-value store ([`KvStore`]) offering point reads, ordered prefix scans
//! and scoped locks. Two backends are provided: an in-memory map for tests
//! and embedding, and a persistent redb database.

pub mod catalog;
pub mod keys;
pub mod kv;
pub mod lock;
pub mod store;
mod tables;

// Re-exports
pub use catalog::MetadataStore;
pub use kv::{KvStore, MemoryKv};
pub use lock::{LockGuard, LockTable};
pub use store::{MetaStoreError, RedbKv};
