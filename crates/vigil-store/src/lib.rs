//! vigil-store: Append-only persistence for snapshots and diffs.
//!
//! Snapshots and diffs are written once and never updated; the only
//! deletion path is the retention sweep. Two backends implement the
//! [`SnapshotStore`] trait: a date-partitioned JSON document store on the
//! filesystem, and an in-memory store for tests and ephemeral runs.

pub mod fs;
pub mod memory;
pub mod store;

pub use fs::FsSnapshotStore;
pub use memory::MemorySnapshotStore;
pub use store::{Page, Pagination, SnapshotFilter, SnapshotStore, StoreError};
