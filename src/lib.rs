//! pledgerun - Resumable, checkpointed web form submission over CDP.
//!
//! ## Architecture
//!
//! A single pipeline, one row at a time:
//! - **Row Source**: Headerless two-column CSV (phone, pledge), decoded with
//!   the first candidate encoding that accepts the whole file
//! - **Checkpoint Store**: JSON map of row key → success entry, rewritten
//!   after every confirmed submission
//! - **Submission Driver**: Fill → submit → confirm against a `FormPage`,
//!   with bounded retries and a wall-clock budget
//! - **Backfill**: Marks a range of rows as done without a browser
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Row keys, entry schema, state transitions
//! - B_i (Beliefs): Input and store I/O wrapped in Result
//! - I^R (Resolvable): Selectors, timeouts, pacing in config
//! - I^B (Bounded): Remote page behavior (retry, confirmation deadline)

pub mod browser;
pub mod checkpoint;
pub mod models;
pub mod pipeline;
pub mod source;

// Re-exports for convenience
pub use browser::{CdpClient, CdpFormPage};
pub use checkpoint::{CheckpointEntry, CheckpointStore};
pub use models::{Config, PledgeError, Result, Row, RowKey, RunStats, StopReason};
pub use pipeline::{backfill, BackfillReport, BackfillRequest, FormPage, SubmissionDriver};
pub use source::RowSource;
