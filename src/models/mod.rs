//! Core data models for pledgerun.
//!
//! Mapping:
//! - K_i (Knowledge): Rows and keys with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants with retry/stop classification

mod config;
mod error;
mod row;

pub use config::*;
pub use error::*;
pub use row::*;
