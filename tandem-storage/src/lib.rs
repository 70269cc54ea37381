//! Durable storage for Tandem.
//!
//! Provides the write-ahead operation log and the persistence port it writes
//! through.
//!
//! # Architecture
//!
//! - [`Wal`] is the single source of truth for local history. Entries move
//!   `Pending → Synced` (or `→ Failed` after too many retries) through
//!   compare-and-set transitions.
//! - Projections are rebuilt from the last [`Snapshot`] of each document plus
//!   a replay of the surviving log.
//! - [`SqliteStore`] is the bundled durable adapter; [`MemoryStore`] backs
//!   tests and can inject failures.

mod error;
mod memory;
mod persistence;
mod sqlite;
mod wal;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use persistence::{Checkpoint, PersistedState, Persistence, Snapshot};
pub use sqlite::SqliteStore;
pub use wal::{EntryStatus, PendingEntries, Recovery, RetryPolicy, Wal, WalEntry};
