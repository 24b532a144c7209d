//! Shared classification utilities.
//!
//! - `thresholds`: `(cutoff, level)` tables and the worst-case combinator.
//! - `stalenesses`: tolerance windows and hour buckets.

pub mod stalenesses;
pub mod thresholds;
