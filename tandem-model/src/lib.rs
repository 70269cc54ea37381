//! Entity model for Tandem.
//!
//! Defines the per-type declarations and the plain-entity projection:
//! - [`EntitySchema`] — declares an entity type's conflict strategy and delete policy
//! - [`ConflictStrategy`] — how concurrent writes resolve (LWW, FWW, field merge, CRDT, user)
//! - [`Entity`] — the projection of field writes and deletes for one entity
//! - [`MergeHandler`] — optional trait for custom field merges
//!
//! These types are consumed by the sync crate and (via JSON) by configuration.

mod entity;
mod handler;
mod schema;

pub use entity::{Entity, FieldState};
pub use handler::MergeHandler;
pub use schema::{ConflictStrategy, DeletePolicy, EntitySchema, FieldMergeTable, FieldRule};
