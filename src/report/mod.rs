//! Report rendering for CLI runs.

pub mod generator;

pub use generator::{write_report, RunMetadata};
