//! Admission control keyed by client address.
//!
//! - [`token_bucket`]: lazily refilled bucket guarding submission bursts
//! - [`sliding_window`]: trailing-window counters (hourly jobs, CPU-seconds)
//! - [`engine`]: the per-client quota table and its atomic operations

pub mod engine;
pub mod sliding_window;
pub mod token_bucket;

pub use engine::{Admission, LimitType, QuotaEngine, QuotaSnapshot, StartDenied};
pub use sliding_window::{SlidingWindowLimiter, UsageWindow};
pub use token_bucket::TokenBucket;
