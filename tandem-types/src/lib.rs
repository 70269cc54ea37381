//! Core type definitions for Tandem.
//!
//! This crate defines the fundamental types shared by every layer of the
//! synchronization core:
//! - Replica, entity, operation and character identifiers
//! - Vector clock timestamps and the causality-consistent [`Stamp`] order
//! - The [`Operation`] record that is logged locally and replicated
//!
//! Nothing here performs I/O; storage and transport live in their own
//! crates.

mod clock;
mod ids;
mod operation;

pub use clock::{CausalOrder, Stamp, VectorClock};
pub use ids::{CharId, EntityId, OperationId, ReplicaId};
pub use operation::{Operation, OperationPayload};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),
}

/// Encodes operations for the transport boundary.
///
/// The full field set of every operation is preserved.
pub fn encode_operations(ops: &[Operation]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(ops)?)
}

/// Decodes operations produced by [`encode_operations`].
pub fn decode_operations(bytes: &[u8]) -> Result<Vec<Operation>> {
    Ok(serde_json::from_slice(bytes)?)
}
