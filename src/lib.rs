//! Query analytics agent.
//!
//! Two pipelines turn database activity into per-fingerprint
//! [`qan::MetricsBucket`]s:
//!
//! - [`profiler`] tails individual profile documents and folds them into
//!   fixed, wall-clock aligned windows.
//! - [`statements`] polls cumulative per-statement counters and emits the
//!   delta since the previous poll.

pub mod agent;
pub mod cache;
pub mod clock;
pub mod config;
pub mod export;
pub mod profiler;
pub mod qan;
pub mod statements;
