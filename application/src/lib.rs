//! Application layer for prompt-relay
//!
//! This crate contains use cases, port definitions, and application configuration.
//! It depends only on the domain layer.

pub mod config;
pub mod ports;
pub mod session;
pub mod use_cases;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{ConsumerParams, GeneratorParams, QueueTopology, RelayParams};
pub use ports::{
    answer_engine::{AnswerEngine, FragmentStream, GenerationError},
    answer_sink::{AnswerSink, FanOutSink, SinkError},
    broker::{
        Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, Delivery,
        Subscription,
    },
};
pub use session::BrokerSession;
pub use use_cases::cancellation::{CancelListener, CancellationRegistry};
pub use use_cases::consume::{ConsumerStats, DeliveryHandler, run_consumer};
pub use use_cases::generate_answers::{
    GenerateAnswersError, GenerateAnswersUseCase, GenerationOutcome,
};
pub use use_cases::publish_prompt::{PublishPromptError, PublishPromptUseCase};
pub use use_cases::relay_answers::{RelayAnswersUseCase, RelayOutcome};
