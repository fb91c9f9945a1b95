//! Message broker port
//!
//! Defines the client-side contract the relay needs from a message broker:
//! connections, channels, queue and fanout exchange declaration, publishing
//! and acknowledged consumption. Adapters (AMQP, in-memory) live in the infrastructure layer.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use relay_domain::QueueOptions;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during broker operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker unreachable, URL malformed, or connection lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Channel unusable; a fresh channel must be opened.
    #[error("Channel error: {0}")]
    Channel(String),

    /// Queue or exchange re-declared with options that differ from the
    /// existing one.
    #[error("Queue '{queue}' already exists with different options: {reason}")]
    QueueConflict { queue: String, reason: String },

    /// A single publish failed; the caller may retry it.
    #[error("Publish error: {0}")]
    Publish(String),

    /// Settling a delivery (ack/nack) failed.
    #[error("Acknowledge error: {0}")]
    Acknowledge(String),
}

impl BrokerError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Publish(_))
    }

    /// Whether the error ends the worker: lost connections and
    /// misconfigured queues are not recoverable in-process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::QueueConflict { .. }
        )
    }
}

/// Establishes broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect to the broker at `url`. Never retries; the caller owns the
    /// retry policy.
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A live connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel. Fails with [`BrokerError::Channel`] when the
    /// connection is closed.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    fn is_open(&self) -> bool;

    /// Close the connection and every channel on it. Unsettled deliveries
    /// become redeliverable.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A logical session multiplexed over one connection.
///
/// Operations are applied in the order they are issued. Once a channel
/// reports an error it stays unusable.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue. Idempotent for identical options.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Declare a fanout exchange. Idempotent for the same durability.
    async fn declare_fanout(&self, exchange: &str, durable: bool) -> Result<(), BrokerError>;

    /// Route every message broadcast on `exchange` into `queue` too.
    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError>;

    /// Append `payload` to the queue `queue`.
    ///
    /// With publisher confirms enabled this resolves after the broker
    /// confirmed the message.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Publish `payload` to the fanout `exchange`, copying it into every
    /// bound queue. Nothing is stored when no queue is bound.
    async fn broadcast(&self, exchange: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries per consumer on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Start consuming `queue`. Deliveries arrive in broker order.
    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Subscription, BrokerError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negative acknowledgment; `requeue = false` discards the message.
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message handed to a consumer.
///
/// Settling methods take `self`, so a delivery is settled at most once.
/// Dropping it unsettled leaves the message pending on the broker until
/// the channel closes, after which it is redelivered.
pub struct Delivery {
    payload: Vec<u8>,
    delivery_tag: u64,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        payload: Vec<u8>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            payload,
            delivery_tag,
            redelivered,
            acker,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Return the message to the queue for redelivery.
    pub async fn requeue(self) -> Result<(), BrokerError> {
        self.acker.nack(true).await
    }

    /// Discard the message (poison payloads).
    pub async fn reject(self) -> Result<(), BrokerError> {
        self.acker.nack(false).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Stream of deliveries from one consumer.
///
/// Ends (`None`) when the channel or connection closes.
pub struct Subscription {
    queue: String,
    stream: BoxStream<'static, Result<Delivery, BrokerError>>,
}

impl Subscription {
    pub fn new(
        queue: impl Into<String>,
        stream: BoxStream<'static, Result<Delivery, BrokerError>>,
    ) -> Self {
        Self {
            queue: queue.into(),
            stream,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        self.stream.next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(BrokerError::Publish("x".into()).is_transient());
        assert!(!BrokerError::Channel("x".into()).is_transient());
        assert!(BrokerError::Connection("x".into()).is_fatal());
        assert!(
            BrokerError::QueueConflict {
                queue: "q".into(),
                reason: "durable".into()
            }
            .is_fatal()
        );
        assert!(!BrokerError::Channel("x".into()).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = BrokerError::QueueConflict {
            queue: "prompt_queue".into(),
            reason: "durable=true vs durable=false".into(),
        };
        assert_eq!(
            err.to_string(),
            "Queue 'prompt_queue' already exists with different options: durable=true vs durable=false"
        );
    }
}
