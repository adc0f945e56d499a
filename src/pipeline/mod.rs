//! Pipeline module - browser submission and checkpoint backfill.

mod backfill;
mod form;
mod retry;
mod submit;

pub use backfill::*;
pub use form::*;
pub use retry::*;
pub use submit::*;
