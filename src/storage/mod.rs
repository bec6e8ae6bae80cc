//! Persisted state
//!
//! The appliance keeps three things on disk, all deliberately simple:
//! the boat identity file, the push token store (owned by
//! [`crate::alerts`]), and the optional replication recording sink.

pub mod identity;
pub mod recorder;

pub use identity::load_or_create_boat_id;
pub use recorder::Recorder;
