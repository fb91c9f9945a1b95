//! Shared consume loop.
//!
//! Every consuming side (generator, relay, cancel listener) runs the same
//! long-lived loop: open a consumer channel, subscribe, hand each delivery
//! to a [`DeliveryHandler`] and wait for it to finish before pulling the
//! next one. The loop ends when the shutdown token fires; the delivery being
//! handled at that moment is completed first.

use crate::config::ConsumerParams;
use crate::ports::broker::{BrokerError, Delivery};
use crate::session::BrokerSession;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handles one delivery to completion, including settling it.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Process and settle `delivery`.
    ///
    /// An `Err` means the channel is no longer usable (the loop resubscribes)
    /// or, for fatal errors, that the worker must stop.
    async fn handle(&self, delivery: Delivery) -> Result<(), BrokerError>;

    /// Called after the consumer channel was lost, before resubscribing.
    /// Deliveries held from the old channel are no longer settleable.
    async fn on_channel_reset(&self) {}
}

/// Counters reported when a consume loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub deliveries: u64,
    pub resubscriptions: u64,
}

enum Next {
    Shutdown,
    Delivery(Delivery),
    Failed(BrokerError),
    Ended,
}

/// Consume `queue` until `shutdown` fires or a fatal error occurs.
pub async fn run_consumer(
    session: &BrokerSession,
    queue: &str,
    params: &ConsumerParams,
    handler: &dyn DeliveryHandler,
    shutdown: &CancellationToken,
) -> Result<ConsumerStats, BrokerError> {
    let mut stats = ConsumerStats::default();

    loop {
        let channel = session.consumer_channel(params.prefetch).await?;
        let mut subscription = channel.subscribe(queue, &params.consumer_tag).await?;
        info!(
            queue = subscription.queue(),
            prefetch = params.prefetch,
            "Consuming"
        );

        let failure = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Next::Shutdown,
                item = subscription.next() => match item {
                    Some(Ok(delivery)) => Next::Delivery(delivery),
                    Some(Err(e)) => Next::Failed(e),
                    None => Next::Ended,
                },
            };

            match next {
                Next::Shutdown => {
                    info!(queue, deliveries = stats.deliveries, "Consumer stopping");
                    if let Err(e) = channel.close().await {
                        debug!("Closing consumer channel: {}", e);
                    }
                    return Ok(stats);
                }
                Next::Delivery(delivery) => {
                    stats.deliveries += 1;
                    if let Err(e) = handler.handle(delivery).await {
                        break e;
                    }
                }
                Next::Failed(e) => break e,
                Next::Ended => break BrokerError::Channel("subscription ended".to_string()),
            }
        };

        if failure.is_fatal() || !session.is_connected() {
            return Err(match failure {
                BrokerError::Channel(reason) if !session.is_connected() => {
                    BrokerError::Connection(reason)
                }
                other => other,
            });
        }

        warn!(queue, "Consumer channel lost ({}), resubscribing", failure);
        if let Err(e) = channel.close().await {
            debug!("Closing failed consumer channel: {}", e);
        }
        handler.on_channel_reset().await;
        stats.resubscriptions += 1;

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(stats),
            _ = tokio::time::sleep(params.resubscribe_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeBroker, Settlement};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct AckingHandler {
        broker: FakeBroker,
        shutdown: CancellationToken,
        stop_after: u64,
        fail_first: bool,
        handled: AtomicU64,
        resets: AtomicU64,
    }

    impl AckingHandler {
        fn new(broker: &FakeBroker, shutdown: &CancellationToken, stop_after: u64) -> Self {
            Self {
                broker: broker.clone(),
                shutdown: shutdown.clone(),
                stop_after,
                fail_first: false,
                handled: AtomicU64::new(0),
                resets: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl DeliveryHandler for AckingHandler {
        async fn handle(&self, delivery: Delivery) -> Result<(), BrokerError> {
            delivery.ack().await?;
            let handled = self.handled.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_first && handled == 1 {
                self.broker.fail_subscriptions();
                self.broker.push("q", b"second", 2);
            }
            if handled >= self.stop_after {
                self.shutdown.cancel();
            }
            Ok(())
        }

        async fn on_channel_reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn params() -> ConsumerParams {
        ConsumerParams::default().with_resubscribe_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn handles_deliveries_until_shutdown() {
        let broker = FakeBroker::new();
        let session = BrokerSession::from_connection(broker.connection());
        let shutdown = CancellationToken::new();
        let handler = AckingHandler::new(&broker, &shutdown, 2);
        broker.push("q", b"one", 1);
        broker.push("q", b"two", 2);

        let stats = run_consumer(&session, "q", &params(), &handler, &shutdown)
            .await
            .unwrap();

        assert_eq!(stats.deliveries, 2);
        assert_eq!(stats.resubscriptions, 0);
        assert_eq!(
            broker.settlements(),
            vec![(1, Settlement::Ack), (2, Settlement::Ack)]
        );
    }

    #[tokio::test]
    async fn resubscribes_after_channel_loss() {
        let broker = FakeBroker::new();
        let session = BrokerSession::from_connection(broker.connection());
        let shutdown = CancellationToken::new();
        let mut handler = AckingHandler::new(&broker, &shutdown, 2);
        handler.fail_first = true;
        broker.push("q", b"first", 1);

        let stats = run_consumer(&session, "q", &params(), &handler, &shutdown)
            .await
            .unwrap();

        assert_eq!(stats.deliveries, 2);
        assert_eq!(stats.resubscriptions, 1);
        assert_eq!(handler.resets.load(Ordering::SeqCst), 1);
        assert_eq!(broker.channels_opened(), 2);
    }

    #[tokio::test]
    async fn lost_connection_is_fatal() {
        let broker = FakeBroker::new();
        let session = BrokerSession::from_connection(broker.connection());
        let shutdown = CancellationToken::new();
        let handler = AckingHandler::new(&broker, &shutdown, 10);
        session.shutdown().await.unwrap();

        let err = run_consumer(&session, "q", &params(), &handler, &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Connection(_)));
    }
}
