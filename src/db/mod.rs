//! Database module for netdiag.
//!
//! Provides SQLite storage with embedded migrations.

mod store;
mod writer;

pub use store::*;
pub use writer::*;
