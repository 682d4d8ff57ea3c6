//! Durable record storage and per-job memoization.

pub mod durable;
pub mod memo;

pub use durable::{CacheStats, RecordCache, TtlClass, TtlPolicy};
pub use memo::MemoCache;
