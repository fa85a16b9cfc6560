//! Per-kind diagnostic sessions and the store that owns them.

mod models;
mod stats;
mod store;

pub use models::*;
pub use stats::*;
pub use store::*;
