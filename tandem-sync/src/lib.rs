//! Offline-first replication for Tandem.
//!
//! A [`Replica`] accepts local writes at any time, with or without a
//! network. A [`SyncCoordinator`] later pushes those writes to a remote and
//! merges the remote's operations back in.
//!
//! # Architecture
//!
//! Every write becomes an [`Operation`](tandem_types::Operation) that is
//! stamped with the replica's vector clock and appended to the write-ahead
//! log before it touches any in-memory state. Projections (CRDT documents
//! and plain entities) are derived from the log and from snapshots, so they
//! can always be rebuilt after a crash.
//!
//! ## Components
//!
//! - **Replica**: local mutation API, projections and crash recovery
//! - **Resolver**: per-type conflict strategies for plain entity fields
//! - **Transport**: push/pull abstraction over any remote
//! - **Coordinator**: drain, pull and atomic merge, with retry and backoff
//! - **Presenter**: optional UI hook for `UserChoice` conflicts
//!
//! ## Sync Process
//!
//! 1. **Drain**: push pending log entries in order; only acknowledged
//!    entries are marked synced
//! 2. **Pull**: fetch remote operations after the committed cursor
//! 3. **Merge**: apply causally ready operations, defer the rest, and
//!    commit snapshots and the new cursor in one transaction
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tandem_crdt::CrdtKind;
//! use tandem_model::EntitySchema;
//! use tandem_storage::MemoryStore;
//! use tandem_sync::{Replica, SyncConfig};
//! use tandem_types::{EntityId, ReplicaId};
//!
//! let config = SyncConfig::default()
//!     .with_schema(EntitySchema::crdt("likes", CrdtKind::PnCounter));
//! let replica = Replica::open(ReplicaId::new(), config, Arc::new(MemoryStore::new())).unwrap();
//!
//! let post = EntityId::new();
//! replica.increment("likes", post, 2).unwrap();
//! assert_eq!(replica.counter_value(post).unwrap(), Some(2));
//! ```

mod config;
mod coordinator;
mod error;
mod presenter;
mod projection;
mod replica;
mod resolver;
pub mod transport;

pub use config::{DEFAULT_BATCH_SIZE, SyncConfig};
pub use coordinator::{QuarantinedOperation, SyncCoordinator, SyncPhase, SyncReport};
pub use error::{SyncError, SyncResult};
pub use presenter::{ConflictPresenter, UserResolution};
pub use projection::{Projection, ProjectionState};
pub use replica::Replica;
pub use resolver::{ConflictRecord, ConflictResolver, FieldWrite, Resolution};
pub use transport::{PullBatch, PushAck, Transport};
