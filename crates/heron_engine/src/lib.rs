//! Engine coordinator for heron.
//!
//! Owns the per-table resource pools, the cross-pool table locking
//! protocol, and the background jobs that keep pooled resources fresh and
//! fold sequenced WAL transactions into table storage. Sequencing itself
//! lives in `heron_wal`; shared types in `heron_common`.

pub mod apply;
pub mod engine;
pub mod fs_ops;
mod lock;
pub mod maintenance;
pub mod meta_view;
pub mod pool;
pub mod table_reader;
pub mod table_writer;
pub mod wal_writer;

pub use apply::WalApplyJob;
pub use engine::{Engine, TableWriterApi};
pub use lock::TableLockGuard;
pub use maintenance::MaintenanceJob;
pub use pool::{Pool, PoolEvent, PoolListener, PoolStats, PooledHandle};
