//! Repository layer for database access.

pub mod catalog;
pub mod catalog_tx;

pub use catalog::*;
pub use catalog_tx::*;
