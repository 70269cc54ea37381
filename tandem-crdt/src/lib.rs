//! CRDT implementations for Tandem.
//!
//! This crate provides the causality tracker and the replicated value types:
//!
//! - [`CausalityTracker`] — per-replica vector clock
//! - [`GCounter`] — grow-only counter
//! - [`PNCounter`] — Positive-Negative Counter for distributed inc/dec
//! - [`LwwRegister<T>`] — single value, last writer wins
//! - [`LwwElementSet<T>`] — add/remove set with last-writer-wins per element
//! - [`Rga<T>`] — Replicated Growable Array for sequences/text
//! - [`CrdtDocument`] — one of the above plus its lifecycle
//!
//! All CRDTs in this crate satisfy the following properties:
//! - **Commutative**: merge(a, b) == merge(b, a)
//! - **Associative**: merge(merge(a, b), c) == merge(a, merge(b, c))
//! - **Idempotent**: merge(a, a) == a
//!
//! These properties ensure that replicas will converge to the same state
//! regardless of the order in which operations are received.

mod document;
mod g_counter;
mod lww_register;
mod lww_set;
mod pn_counter;
mod rga;
mod tracker;

pub use document::{CrdtDocument, CrdtKind, CrdtState, DocumentState, DocumentValue};
pub use g_counter::GCounter;
pub use lww_register::LwwRegister;
pub use lww_set::LwwElementSet;
pub use pn_counter::PNCounter;
pub use rga::Rga;
pub use tracker::CausalityTracker;

/// Result type for CRDT operations.
pub type CrdtResult<T> = Result<T, CrdtError>;

/// Errors raised when an operation or state does not fit a document.
#[derive(Debug, thiserror::Error)]
pub enum CrdtError {
    #[error("{payload} operation cannot be applied to a {kind} document")]
    KindMismatch {
        kind: CrdtKind,
        payload: &'static str,
    },

    #[error("cannot merge a {remote} document into a {local} document")]
    MergeMismatch { local: CrdtKind, remote: CrdtKind },

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}
