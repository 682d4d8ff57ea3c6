//! Clients for the two external providers, behind traits so the pipeline
//! can run against in-process fakes.

pub mod inference;
pub mod telemetry;

pub use inference::{ChatClient, ChatClientConfig, InferenceService};
pub use telemetry::{RiotClient, RiotClientConfig, TelemetryError, TelemetrySource};
