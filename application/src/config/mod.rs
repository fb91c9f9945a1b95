//! Application-level configuration.
//!
//! This module provides configuration types that control how use cases behave:
//!
//! - [`QueueTopology`] - queue names and declaration options
//! - [`ConsumerParams`], [`GeneratorParams`], [`RelayParams`] - consume loop control

pub mod topology;
pub mod worker_params;

pub use topology::QueueTopology;
pub use worker_params::{ConsumerParams, GeneratorParams, RelayParams};
