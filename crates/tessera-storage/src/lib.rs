//! Tessera Storage - Embedded partitioned storage engine
//!
//! This crate provides:
//! - A write-ahead transaction journal over a plain directory tree
//! - Startup recovery of interrupted transactions and safe writes
//! - Partition leases and record-level named locks
//! - Sessions with schema, contract and row records
//! - A bounded FIFO/TTL cache in front of file reads
//! - Per-partition credentials

pub mod cache;
pub mod credentials;
pub mod engine;
pub mod journal;
pub mod middleware;
pub mod named_lock;
pub mod partition;
pub mod records;
pub mod recovery;
pub mod safe_io;
pub mod session;
pub mod tlru;

pub use cache::{CacheMiddleware, CacheStats};
pub use credentials::{Credentials, Permissions};
pub use engine::Engine;
pub use journal::{ActionKind, JournalAction, Transaction};
pub use middleware::{FileMiddleware, FileStore, NoCache};
pub use named_lock::{NamedLockGuard, NamedLockRegistry};
pub use records::{ContractDef, StructDef, StructTombstones};
pub use recovery::RecoveryReport;
pub use session::Session;
pub use tessera_common::{CacheConfig, EngineConfig, Error, Result, SyncMode};
