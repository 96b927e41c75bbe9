//! # Observability
//!
//! - `metrics`: Prometheus metrics collection, served over HTTP by [`crate::server`].
//! - `logging`: `tracing-subscriber` initialization shared by both binaries.

pub mod logging;
pub mod metrics;

pub use metrics::{increment_git_errors, increment_git_ops, publish_service_state, register_metrics};
