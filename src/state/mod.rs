//! State core: the authoritative document and its replication
//!
//! One writer task owns the document; everything else observes it through
//! copies. Mutations arrive as JSON-Patch submissions (or typed setters
//! that construct them), are validated and applied in arrival order, and
//! fan out on two replication channels: incremental `state:patch` events
//! and gated `state:full-update` snapshots.

pub mod core;
pub mod document;
pub mod patch;
pub mod schema;

pub use core::{ReplicationEvent, StateCore, StateError, StateHandle};
pub use document::{escape_token, pointer_to_dot, DocumentError, StateDocument};
pub use patch::{DeltaValue, PatchError, PatchOp, StateDelta};
pub use schema::default_document;
