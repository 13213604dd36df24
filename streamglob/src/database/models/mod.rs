//! Database row models.

pub mod catalog;

pub use catalog::*;
