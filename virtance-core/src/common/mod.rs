//! Shared utilities used across the orchestrator

pub mod error_context;

pub use error_context::{JsonContext, OptionContext, ResultContext, StorageContext};
