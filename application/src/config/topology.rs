//! Queue topology shared by every side of the relay.

use crate::ports::broker::BrokerError;
use crate::session::BrokerSession;
use relay_domain::QueueOptions;

/// Default prompt queue name, shared with the TypeScript API service.
pub const DEFAULT_PROMPT_QUEUE: &str = "prompt_queue";
/// Default answer queue name, shared with the TypeScript API service.
pub const DEFAULT_ANSWER_QUEUE: &str = "answer_queue";
/// Default fanout exchange carrying cancel requests to every generator.
pub const DEFAULT_CANCEL_EXCHANGE: &str = "prompt_cancel";

/// Names and options of the queues and exchanges the relay uses.
///
/// Prompts and answers are work queues shared by all workers of a side.
/// Cancel requests are broadcast: each generator process binds a private
/// queue of its own to the cancel exchange, so the process that owns the
/// prompt always hears about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub prompt: String,
    pub answer: String,
    pub cancel_exchange: String,
    pub options: QueueOptions,
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT_QUEUE.to_string(),
            answer: DEFAULT_ANSWER_QUEUE.to_string(),
            cancel_exchange: DEFAULT_CANCEL_EXCHANGE.to_string(),
            options: QueueOptions::default(),
        }
    }
}

impl QueueTopology {
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.options.durable = durable;
        self
    }

    pub fn with_names(
        mut self,
        prompt: impl Into<String>,
        answer: impl Into<String>,
        cancel_exchange: impl Into<String>,
    ) -> Self {
        self.prompt = prompt.into();
        self.answer = answer.into();
        self.cancel_exchange = cancel_exchange.into();
        self
    }

    /// Declare the work queues and the cancel exchange on the session.
    /// Conflicting options surface here, at startup, as
    /// [`BrokerError::QueueConflict`].
    pub async fn declare_on(&self, session: &BrokerSession) -> Result<(), BrokerError> {
        for name in [&self.prompt, &self.answer] {
            session.declare(name, self.options).await?;
        }
        session
            .declare_fanout(&self.cancel_exchange, self.options.durable)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeBroker;

    #[test]
    fn test_default_names() {
        let topology = QueueTopology::default();
        assert_eq!(topology.prompt, "prompt_queue");
        assert_eq!(topology.answer, "answer_queue");
        assert_eq!(topology.cancel_exchange, "prompt_cancel");
        assert!(!topology.options.durable);
    }

    #[test]
    fn test_builder() {
        let topology = QueueTopology::default()
            .with_names("p", "a", "c")
            .with_durable(true);
        assert_eq!(topology.prompt, "p");
        assert_eq!(topology.answer, "a");
        assert_eq!(topology.cancel_exchange, "c");
        assert!(topology.options.durable);
    }

    #[tokio::test]
    async fn test_declares_queues_and_exchange() {
        let broker = FakeBroker::new();
        let session = BrokerSession::from_connection(broker.connection());
        QueueTopology::default().declare_on(&session).await.unwrap();
        assert_eq!(broker.declarations("prompt_queue"), 1);
        assert_eq!(broker.declarations("answer_queue"), 1);
        assert_eq!(broker.declarations("prompt_cancel"), 1);
    }
}
