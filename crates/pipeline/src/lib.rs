//! Batch orchestration: drives every prompt pair through patch, submit,
//! wait, and download, and reports what happened.

pub mod config;
pub mod error;
pub mod runner;
pub mod summary;

pub use config::RunConfig;
pub use error::ItemError;
pub use runner::BatchRunner;
pub use summary::RunSummary;
