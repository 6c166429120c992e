//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Catalog namespace; keys are produced by `crate::keys`
pub const KV: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");
