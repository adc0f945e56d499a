//! Row source: headerless two-column CSV with encoding sniffing.
//!
//! Provides:
//! - `SourceEncoding`: Ordered candidate decoders
//! - `RowSource`: A decoded file that yields `Row`s lazily

mod decode;
mod reader;

pub use decode::*;
pub use reader::*;
