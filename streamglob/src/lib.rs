//! streamglob library crate.
//!
//! The task execution core: tasks and their state machine, the download
//! postprocessing pipeline, the completion recorder and the task manager,
//! plus the catalog, configuration and provider plumbing around them.

pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod manager;
pub mod pipeline;
pub mod program;
pub mod provider;
pub mod recorder;
pub mod task;
pub mod utils;

pub use error::{Error, Result};
