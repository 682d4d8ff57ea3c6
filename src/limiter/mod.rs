//! Pacing primitives for the two upstream providers.

pub mod backoff;
pub mod quota;

pub use backoff::{AdaptiveBackoff, BackoffPolicy, BackoffSnapshot};
pub use quota::{QuotaLimiter, QuotaWindow, WindowUsage};
