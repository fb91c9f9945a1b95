//! Queue-level value objects.

pub mod options;

pub use options::QueueOptions;
