//! Worker parameters: consume loop control.
//!
//! [`ConsumerParams`] is shared by every consume loop; [`GeneratorParams`]
//! and [`RelayParams`] add the knobs specific to each side.

use std::time::Duration;

/// Consume loop parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerParams {
    /// Maximum unacknowledged deliveries on the consumer channel.
    pub prefetch: u16,
    /// Consumer tag announced to the broker.
    pub consumer_tag: String,
    /// Pause before resubscribing after the consumer channel failed.
    pub resubscribe_delay: Duration,
}

impl Default for ConsumerParams {
    fn default() -> Self {
        Self {
            prefetch: 16,
            consumer_tag: String::new(),
            resubscribe_delay: Duration::from_secs(1),
        }
    }
}

impl ConsumerParams {
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }
}

/// Generator-side parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorParams {
    pub consumer: ConsumerParams,
    /// Pause before requeueing a prompt whose generation failed.
    pub failure_backoff: Duration,
    /// How many early cancel requests to remember.
    pub cancel_history: usize,
}

impl Default for GeneratorParams {
    fn default() -> Self {
        Self {
            consumer: ConsumerParams::default()
                .with_prefetch(1)
                .with_consumer_tag("answer-generator"),
            failure_backoff: Duration::from_millis(500),
            cancel_history: 1024,
        }
    }
}

impl GeneratorParams {
    pub fn with_consumer(mut self, consumer: ConsumerParams) -> Self {
        self.consumer = consumer;
        self
    }

    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }
}

/// Relay-side parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayParams {
    pub consumer: ConsumerParams,
    /// Early fragments held per prompt while waiting for a gap to fill.
    /// Must stay below the prefetch, or the gap can never be delivered.
    pub max_buffered_fragments: usize,
    /// Finished prompts remembered to drop late duplicates.
    pub completed_history: usize,
    /// Answers tracked at once; past this the idlest one is given up.
    pub max_open_streams: usize,
    /// Pause before requeueing a fragment the sink could not take.
    pub retry_delay: Duration,
}

impl Default for RelayParams {
    fn default() -> Self {
        Self {
            consumer: ConsumerParams::default().with_consumer_tag("answer-relay"),
            max_buffered_fragments: 8,
            completed_history: 1024,
            max_open_streams: 1024,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl RelayParams {
    pub fn with_consumer(mut self, consumer: ConsumerParams) -> Self {
        self.consumer = consumer;
        self
    }

    pub fn with_max_buffered_fragments(mut self, max: usize) -> Self {
        self.max_buffered_fragments = max;
        self
    }

    pub fn with_completed_history(mut self, history: usize) -> Self {
        self.completed_history = history;
        self
    }

    pub fn with_max_open_streams(mut self, max: usize) -> Self {
        self.max_open_streams = max;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let generator = GeneratorParams::default();
        assert_eq!(generator.consumer.prefetch, 1);
        assert_eq!(generator.consumer.consumer_tag, "answer-generator");

        let relay = RelayParams::default();
        assert_eq!(relay.consumer.prefetch, 16);
        assert!(relay.max_buffered_fragments < relay.consumer.prefetch as usize);
    }

    #[test]
    fn test_builder() {
        let relay = RelayParams::default()
            .with_max_buffered_fragments(2)
            .with_retry_delay(Duration::ZERO)
            .with_max_open_streams(3)
            .with_consumer(ConsumerParams::default().with_prefetch(4));
        assert_eq!(relay.max_buffered_fragments, 2);
        assert_eq!(relay.retry_delay, Duration::ZERO);
        assert_eq!(relay.max_open_streams, 3);
        assert_eq!(relay.consumer.prefetch, 4);
    }
}
