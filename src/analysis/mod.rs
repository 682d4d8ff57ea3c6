//! Statistics derived from fetched match records.

pub mod aggregator;

pub use aggregator::*;
