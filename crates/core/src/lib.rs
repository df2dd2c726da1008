//! Domain types for the comfybatch orchestrator.
//!
//! Holds everything that does not talk to the network: job template
//! parsing and prompt injection, the prompt file format, and the
//! deterministic naming of downloaded artifacts.

pub mod error;
pub mod naming;
pub mod prompts;
pub mod types;
pub mod workflow;
