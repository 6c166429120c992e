//! Polymerase Placement - choosing the node that hosts a database
//!
//! A database's backups stay on the node that received its first backup,
//! since incremental chains are resolved against that node's catalog and
//! storage. New databases go to the node with the most free disk.

pub mod allocator;

pub use allocator::{NodeAllocator, Placement, select_by_capacity};
