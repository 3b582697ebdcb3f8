#![recursion_limit = "128"]
//! Matchwatch Core Library
//!
//! Exposes the ingestion, evaluation, pattern-detection and dispatch
//! pipeline for use by the daemon binary and integration tests.

pub mod broadcast;
pub mod condition;
pub mod config;
pub mod dispatch;
pub mod formula;
pub mod ingestion;
pub mod metrics;
pub mod model;
pub mod patterns;
pub mod persistence;
pub mod scheduler;
pub mod store;
pub mod upstream;

pub use config::Config;
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerStats};
