//! Infrastructure layer for prompt-relay
//!
//! This crate contains adapters that implement the ports defined
//! in the application layer, including configuration file loading.

pub mod broker;
pub mod config;
pub mod engine;
pub mod sink;


// Re-export commonly used types
#[cfg(feature = "amqp")]
pub use broker::AmqpConnector;
pub use broker::{MemoryBroker, SUPPORTED_SCHEMES, connector_for_url};
pub use config::{
    ConfigLoader, ConfigValidationError, FileBrokerConfig, FileConfig, FileGeneratorConfig,
    FileQueuesConfig, FileRelayConfig, FileSinkKind,
};
pub use engine::PlaceholderEngine;
pub use sink::{AnswerStream, JsonlAnswerSink, LiveStreamSink};
