//! Checkpoint module for resumable submission runs.
//!
//! Provides:
//! - `CheckpointEntry`: Record that one row was submitted successfully
//! - `CheckpointStore`: Loading, querying, and persisting the entry map

mod store;

pub use store::*;
