//! Threshold classification and data freshness.
//!
//! - `thresholds` maps readings to warning levels against configured bounds.
//! - `stalenesses` grades how old the latest snapshot is.

pub mod stalenesses;
pub mod thresholds;
