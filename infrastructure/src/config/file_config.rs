//! Raw TOML configuration data types
//!
//! These structs represent the exact structure of the TOML config file.
//! Conversions into the application's parameter types live next to them.

use crate::broker::SUPPORTED_SCHEMES;
use relay_application::config::{ConsumerParams, GeneratorParams, QueueTopology, RelayParams};
use relay_application::session::redact_url;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("queues.{0} cannot be empty")]
    EmptyQueueName(&'static str),

    #[error("queue name '{0}' is used for both the prompt and the answer queue")]
    DuplicateQueueName(String),

    #[error("broker.prefetch cannot be 0")]
    ZeroPrefetch,

    #[error("relay.max_open_streams cannot be 0")]
    ZeroOpenStreams,

    #[error(
        "relay.max_buffered_fragments ({buffered}) must be below broker.prefetch ({prefetch})"
    )]
    BufferNotBelowPrefetch { buffered: usize, prefetch: u16 },

    #[error("unsupported broker url '{0}' (expected amqp://, amqps:// or memory://)")]
    UnsupportedUrl(String),
}

/// Raw broker configuration from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileBrokerConfig {
    /// Broker URL; `RABBITMQ_URL` overrides it
    pub url: String,
    /// Wait for broker confirmation on every publish
    pub publisher_confirms: bool,
    /// Unacknowledged deliveries per consumer
    pub prefetch: u16,
}

impl Default for FileBrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672/%2f".to_string(),
            publisher_confirms: true,
            prefetch: 16,
        }
    }
}

/// Raw queue configuration from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileQueuesConfig {
    pub prompt: String,
    pub answer: String,
    /// Fanout exchange cancel requests are broadcast on
    pub cancel_exchange: String,
    /// Declare the queues and the exchange durable
    pub durable: bool,
}

impl Default for FileQueuesConfig {
    fn default() -> Self {
        let topology = QueueTopology::default();
        Self {
            prompt: topology.prompt,
            answer: topology.answer,
            cancel_exchange: topology.cancel_exchange,
            durable: topology.options.durable,
        }
    }
}

/// Raw generator configuration from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileGeneratorConfig {
    /// Fragments per placeholder answer
    pub fragment_count: usize,
    /// Delay between placeholder fragments
    pub fragment_delay_ms: u64,
    /// Wait before requeueing a failed prompt
    pub failure_backoff_ms: u64,
}

impl Default for FileGeneratorConfig {
    fn default() -> Self {
        Self {
            fragment_count: 10,
            fragment_delay_ms: 1000,
            failure_backoff_ms: 500,
        }
    }
}

/// Where the relay hands fragments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSinkKind {
    /// Print to stdout
    #[default]
    Console,
    /// Append to `relay.jsonl_path`
    Jsonl,
    /// Both of the above
    Both,
}

impl FileSinkKind {
    pub fn uses_console(self) -> bool {
        matches!(self, FileSinkKind::Console | FileSinkKind::Both)
    }

    pub fn uses_jsonl(self) -> bool {
        matches!(self, FileSinkKind::Jsonl | FileSinkKind::Both)
    }
}

/// Raw relay configuration from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileRelayConfig {
    pub sink: FileSinkKind,
    pub jsonl_path: PathBuf,
    /// Out-of-order fragments held per prompt
    pub max_buffered_fragments: usize,
    /// Finished prompts remembered for duplicate detection
    pub completed_history: usize,
    /// Answers tracked at once before the idlest is given up
    pub max_open_streams: usize,
    /// Wait before requeueing a fragment the sink refused
    pub retry_delay_ms: u64,
}

impl Default for FileRelayConfig {
    fn default() -> Self {
        let params = RelayParams::default();
        Self {
            sink: FileSinkKind::default(),
            jsonl_path: PathBuf::from("answers.jsonl"),
            max_buffered_fragments: params.max_buffered_fragments,
            completed_history: params.completed_history,
            max_open_streams: params.max_open_streams,
            retry_delay_ms: params.retry_delay.as_millis() as u64,
        }
    }
}

/// Complete file configuration (raw TOML structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Broker connection settings
    pub broker: FileBrokerConfig,
    /// Queue names and options
    pub queues: FileQueuesConfig,
    /// Answer generator settings
    pub generator: FileGeneratorConfig,
    /// Answer relay settings
    pub relay: FileRelayConfig,
}

impl FileConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let scheme = self.broker.url.split_once("://").map(|(s, _)| s);
        if !scheme.is_some_and(|s| SUPPORTED_SCHEMES.contains(&s)) {
            return Err(ConfigValidationError::UnsupportedUrl(redact_url(
                &self.broker.url,
            )));
        }

        let names = [
            ("prompt", &self.queues.prompt),
            ("answer", &self.queues.answer),
            ("cancel_exchange", &self.queues.cancel_exchange),
        ];
        for (field, name) in names {
            if name.trim().is_empty() {
                return Err(ConfigValidationError::EmptyQueueName(field));
            }
        }
        // Exchanges live in their own namespace; only the queues may clash
        if self.queues.prompt == self.queues.answer {
            return Err(ConfigValidationError::DuplicateQueueName(
                self.queues.prompt.clone(),
            ));
        }

        if self.broker.prefetch == 0 {
            return Err(ConfigValidationError::ZeroPrefetch);
        }
        if self.relay.max_open_streams == 0 {
            return Err(ConfigValidationError::ZeroOpenStreams);
        }
        // Held fragments stay unacked; they must not use up the prefetch
        if self.relay.max_buffered_fragments >= self.broker.prefetch as usize {
            return Err(ConfigValidationError::BufferNotBelowPrefetch {
                buffered: self.relay.max_buffered_fragments,
                prefetch: self.broker.prefetch,
            });
        }
        Ok(())
    }

    pub fn topology(&self) -> QueueTopology {
        QueueTopology::default()
            .with_names(
                self.queues.prompt.clone(),
                self.queues.answer.clone(),
                self.queues.cancel_exchange.clone(),
            )
            .with_durable(self.queues.durable)
    }

    pub fn generator_params(&self) -> GeneratorParams {
        GeneratorParams::default()
            .with_failure_backoff(Duration::from_millis(self.generator.failure_backoff_ms))
    }

    pub fn relay_params(&self) -> RelayParams {
        RelayParams::default()
            .with_consumer(
                ConsumerParams::default()
                    .with_prefetch(self.broker.prefetch)
                    .with_consumer_tag("answer-relay"),
            )
            .with_max_buffered_fragments(self.relay.max_buffered_fragments)
            .with_completed_history(self.relay.completed_history)
            .with_max_open_streams(self.relay.max_open_streams)
            .with_retry_delay(Duration::from_millis(self.relay.retry_delay_ms))
    }

    pub fn cancel_params(&self) -> ConsumerParams {
        ConsumerParams::default()
            .with_prefetch(self.broker.prefetch)
            .with_consumer_tag("cancel-listener")
    }

    pub fn fragment_delay(&self) -> Duration {
        Duration::from_millis(self.generator.fragment_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_full_config() {
        let toml_str = r#"
[broker]
url = "amqps://rabbit.internal:5671/prod"
publisher_confirms = false
prefetch = 32

[queues]
prompt = "prompts"
answer = "answers"
cancel_exchange = "cancels"
durable = true

[generator]
fragment_count = 3
fragment_delay_ms = 0

[relay]
sink = "both"
jsonl_path = "/var/log/relay/answers.jsonl"
max_buffered_fragments = 16
max_open_streams = 64
retry_delay_ms = 250
"#;

        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.broker.prefetch, 32);
        assert!(!config.broker.publisher_confirms);
        assert_eq!(config.queues.prompt, "prompts");
        assert_eq!(config.topology().cancel_exchange, "cancels");
        assert!(config.queues.durable);
        assert_eq!(config.generator.fragment_count, 3);
        assert_eq!(config.relay.sink, FileSinkKind::Both);
        assert_eq!(config.relay.max_buffered_fragments, 16);
        assert_eq!(config.relay_params().max_open_streams, 64);
        // Unset keys keep their defaults
        assert_eq!(config.generator.failure_backoff_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = FileConfig::default();
        assert_eq!(config.queues.prompt, "prompt_queue");
        assert_eq!(config.queues.answer, "answer_queue");
        assert_eq!(config.queues.cancel_exchange, "prompt_cancel");
        assert!(!config.queues.durable);
        assert_eq!(config.generator.fragment_count, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = FileConfig::default();
        config.queues.answer = " ".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::EmptyQueueName("answer"))
        );

        let mut config = FileConfig::default();
        config.queues.answer = config.queues.prompt.clone();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::DuplicateQueueName(_))
        ));

        let mut config = FileConfig::default();
        config.queues.cancel_exchange = String::new();
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::EmptyQueueName("cancel_exchange"))
        );

        let mut config = FileConfig::default();
        config.broker.prefetch = 0;
        assert_eq!(config.validate(), Err(ConfigValidationError::ZeroPrefetch));

        let mut config = FileConfig::default();
        config.relay.max_open_streams = 0;
        assert_eq!(config.validate(), Err(ConfigValidationError::ZeroOpenStreams));

        let mut config = FileConfig::default();
        config.relay.max_buffered_fragments = config.broker.prefetch as usize;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::BufferNotBelowPrefetch { .. })
        ));

        let mut config = FileConfig::default();
        config.broker.url = "http://user:pw@host".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::UnsupportedUrl(
                "http://***@host".to_string()
            ))
        );
    }

    #[test]
    fn test_conversions() {
        let mut config = FileConfig::default();
        config.queues.durable = true;
        config.relay.retry_delay_ms = 10;

        let topology = config.topology();
        assert!(topology.options.durable);
        assert_eq!(topology.answer, "answer_queue");

        let relay = config.relay_params();
        assert_eq!(relay.consumer.prefetch, 16);
        assert_eq!(relay.retry_delay, Duration::from_millis(10));
        assert_eq!(config.generator_params().consumer.prefetch, 1);
    }
}
