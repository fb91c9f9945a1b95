//! In-process broker with AMQP-like delivery semantics.
//!
//! Used by the `demo` subcommand and by the pipeline tests. It models what
//! the relay relies on from RabbitMQ and nothing more:
//!
//! - FIFO queues with declaration options; a conflicting re-declare closes
//!   the channel
//! - fanout exchanges copying each broadcast into every bound queue
//! - auto-delete queues vanish with their last consumer, exclusive queues
//!   with their connection
//! - per-channel delivery tags, prefetch and unacked tracking
//! - nack with requeue puts the message back at the head, marked redelivered
//! - closing a channel or connection requeues its unacked deliveries
//!
//! Only `memory://` URLs are accepted.

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use relay_application::ports::broker::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, Delivery,
    Subscription,
};
use relay_domain::QueueOptions;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

pub const MEMORY_SCHEME: &str = "memory";

type DeliverySender = UnboundedSender<Result<Delivery, BrokerError>>;

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    channel_id: u64,
    sender: DeliverySender,
}

struct QueueState {
    options: QueueOptions,
    /// Declaring connection of an exclusive queue
    owner: Option<u64>,
    ready: VecDeque<Message>,
    consumers: Vec<Consumer>,
    had_consumer: bool,
    cursor: usize,
    acked: usize,
}

struct ExchangeState {
    durable: bool,
    bound: Vec<String>,
}

struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Message)>,
}

#[derive(Default)]
struct BrokerState {
    reachable: bool,
    next_id: u64,
    connections: HashMap<u64, bool>,
    channels: HashMap<u64, ChannelState>,
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Push ready messages of `queue` to consumers with spare prefetch.
    fn dispatch(&mut self, queue_name: &str, broker: &MemoryBroker) {
        let BrokerState {
            channels, queues, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        queue
            .consumers
            .retain(|c| !c.sender.is_closed() && channels.contains_key(&c.channel_id));

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let pick = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&i| {
                    channels
                        .get(&queue.consumers[i].channel_id)
                        .is_some_and(|ch| {
                            ch.prefetch == 0 || ch.unacked.len() < ch.prefetch as usize
                        })
                });
            let Some(index) = pick else {
                break;
            };
            queue.cursor = (index + 1) % count;

            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let consumer = &queue.consumers[index];
            let Some(channel) = channels.get_mut(&consumer.channel_id) else {
                queue.ready.push_front(message);
                break;
            };
            channel.next_tag += 1;
            let tag = channel.next_tag;
            let delivery = Delivery::new(
                message.payload.clone(),
                tag,
                message.redelivered,
                Box::new(MemoryAcker {
                    broker: broker.clone(),
                    channel_id: consumer.channel_id,
                    tag,
                }),
            );
            if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                // Receiver went away between the retain and the send
                queue.ready.push_front(message);
                queue.consumers.remove(index);
                queue.cursor = 0;
                continue;
            }
            trace!(queue = queue_name, tag, "Dispatched");
            channel
                .unacked
                .insert(tag, (queue_name.to_string(), message));
        }
    }

    /// Drop a channel and return its unacked deliveries to their queues.
    /// Returns the queues that need a dispatch.
    fn close_channel(&mut self, channel_id: u64) -> Vec<String> {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return Vec::new();
        };
        let mut touched = Vec::new();
        // Newest first, so the oldest ends up at the head again
        for (_, (queue_name, mut message)) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                message.redelivered = true;
                queue.ready.push_front(message);
                if !touched.contains(&queue_name) {
                    touched.push(queue_name);
                }
            }
        }
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }
        self.reap_auto_deleted();
        touched
    }

    /// Delete auto-delete queues that lost their last consumer.
    fn reap_auto_deleted(&mut self) {
        let gone: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.options.auto_delete && q.had_consumer && q.consumers.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        for name in gone {
            self.delete_queue(&name);
        }
    }

    /// Delete the exclusive queues of a closed connection.
    fn drop_exclusive(&mut self, connection_id: u64) {
        let gone: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in gone {
            self.delete_queue(&name);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bound.retain(|queue| queue != name);
        }
        debug!(queue = name, "Queue deleted");
    }

    /// Whether `queue` is exclusive to a connection other than `connection_id`.
    fn locked_for(&self, queue: &str, connection_id: u64) -> bool {
        self.queues
            .get(queue)
            .and_then(|q| q.owner)
            .is_some_and(|owner| owner != connection_id)
    }
}

/// Shared handle to one in-memory broker. Cloning shares the broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                ..BrokerState::default()
            })),
        }
    }

    /// Make new connection attempts fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Sever every open connection, as a broker restart would.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        let mut touched = Vec::new();
        for id in ids {
            touched.extend(state.close_channel(id));
        }
        for open in state.connections.values_mut() {
            *open = false;
        }
        let connection_ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in connection_ids {
            state.drop_exclusive(id);
        }
        for queue in touched {
            state.dispatch(&queue, self);
        }
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|ch| ch.unacked.values())
            .filter(|(name, _)| name == queue)
            .count()
    }

    /// Messages positively acknowledged so far.
    pub fn ack_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.acked)
    }

    pub fn ready_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Queues currently bound to `exchange`.
    pub fn bound_queues(&self, exchange: &str) -> Vec<String> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bound.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settle(&self, channel_id: u64, tag: u64, outcome: Option<bool>) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let Some(channel) = state.channels.get_mut(&channel_id) else {
            return Err(BrokerError::Acknowledge(format!(
                "channel {} is closed",
                channel_id
            )));
        };
        let Some((queue_name, mut message)) = channel.unacked.remove(&tag) else {
            return Err(BrokerError::Acknowledge(format!(
                "unknown delivery tag {}",
                tag
            )));
        };
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            match outcome {
                None => queue.acked += 1,
                Some(true) => {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
                Some(false) => debug!(queue = %queue_name, tag, "Message discarded"),
            }
        }
        state.dispatch(&queue_name, self);
        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        match url.split_once("://") {
            Some((MEMORY_SCHEME, _)) => {}
            _ => {
                return Err(BrokerError::Connection(format!(
                    "unsupported broker url '{}', expected memory://",
                    url
                )));
            }
        }
        let mut state = self.lock();
        if !state.reachable {
            return Err(BrokerError::Connection("broker unreachable".to_string()));
        }
        let id = state.next_id();
        state.connections.insert(id, true);
        debug!(connection = id, "Memory connection opened");
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.broker.lock();
        if !state.connections.get(&self.id).copied().unwrap_or(false) {
            return Err(BrokerError::Channel("connection is closed".to_string()));
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .connections
            .get(&self.id)
            .copied()
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let ids: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection_id == self.id)
            .map(|(id, _)| *id)
            .collect();
        let mut touched = Vec::new();
        for id in ids {
            touched.extend(state.close_channel(id));
        }
        state.connections.insert(self.id, false);
        state.drop_exclusive(self.id);
        for queue in touched {
            state.dispatch(&queue, &self.broker);
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryChannel {
    fn closed(&self) -> BrokerError {
        BrokerError::Channel(format!("channel {} is closed", self.id))
    }

    fn connection_id(&self, state: &BrokerState) -> Result<u64, BrokerError> {
        state
            .channels
            .get(&self.id)
            .map(|channel| channel.connection_id)
            .ok_or_else(|| self.closed())
    }

    fn locked(&self, queue: &str) -> BrokerError {
        BrokerError::Channel(format!(
            "queue '{}' is exclusive to another connection",
            queue
        ))
    }

    /// Close the channel because of an error, as AMQP does.
    fn fail(&self, state: &mut BrokerState, error: BrokerError) -> BrokerError {
        for queue in state.close_channel(self.id) {
            state.dispatch(&queue, &self.broker);
        }
        error
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let connection_id = self.connection_id(&state)?;
        if state.locked_for(name, connection_id) {
            let error = self.locked(name);
            return Err(self.fail(&mut state, error));
        }
        match state.queues.get(name).map(|q| q.options) {
            Some(existing) if !existing.is_compatible_with(&options) => {
                let error = BrokerError::QueueConflict {
                    queue: name.to_string(),
                    reason: format!("declared {:?}, requested {:?}", existing, options),
                };
                Err(self.fail(&mut state, error))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        options,
                        owner: options.exclusive.then_some(connection_id),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        had_consumer: false,
                        cursor: 0,
                        acked: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_fanout(&self, exchange: &str, durable: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(self.closed());
        }
        match state.exchanges.get(exchange).map(|e| e.durable) {
            Some(existing) if existing != durable => {
                let error = BrokerError::QueueConflict {
                    queue: exchange.to_string(),
                    reason: format!(
                        "exchange declared durable={}, requested durable={}",
                        existing, durable
                    ),
                };
                Err(self.fail(&mut state, error))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    exchange.to_string(),
                    ExchangeState {
                        durable,
                        bound: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let connection_id = self.connection_id(&state)?;
        let error = if !state.queues.contains_key(queue) {
            Some(BrokerError::Channel(format!("no queue '{}'", queue)))
        } else if !state.exchanges.contains_key(exchange) {
            Some(BrokerError::Channel(format!("no exchange '{}'", exchange)))
        } else if state.locked_for(queue, connection_id) {
            Some(self.locked(queue))
        } else {
            None
        };
        if let Some(error) = error {
            return Err(self.fail(&mut state, error));
        }
        if let Some(target) = state.exchanges.get_mut(exchange)
            && !target.bound.iter().any(|bound| bound == queue)
        {
            target.bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(self.closed());
        }
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(BrokerError::Publish(format!("no queue '{}'", queue)));
        };
        target.ready.push_back(Message {
            payload: payload.to_vec(),
            redelivered: false,
        });
        state.dispatch(queue, &self.broker);
        Ok(())
    }

    async fn broadcast(&self, exchange: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(self.closed());
        }
        let Some(bound) = state.exchanges.get(exchange).map(|e| e.bound.clone()) else {
            return Err(BrokerError::Publish(format!("no exchange '{}'", exchange)));
        };
        for name in &bound {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.ready.push_back(Message {
                    payload: payload.to_vec(),
                    redelivered: false,
                });
            }
        }
        trace!(exchange, queues = bound.len(), "Broadcast");
        for name in bound {
            state.dispatch(&name, &self.broker);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        match state.channels.get_mut(&self.id) {
            Some(channel) => {
                channel.prefetch = count;
                Ok(())
            }
            None => Err(self.closed()),
        }
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Subscription, BrokerError> {
        let mut state = self.broker.lock();
        let connection_id = self.connection_id(&state)?;
        if state.locked_for(queue, connection_id) {
            let error = self.locked(queue);
            return Err(self.fail(&mut state, error));
        }
        let (sender, receiver) = unbounded();
        let Some(target) = state.queues.get_mut(queue) else {
            let error = BrokerError::Channel(format!("no queue '{}'", queue));
            return Err(self.fail(&mut state, error));
        };
        target.consumers.push(Consumer {
            channel_id: self.id,
            sender,
        });
        target.had_consumer = true;
        debug!(queue, consumer_tag, channel = self.id, "Consumer registered");
        state.dispatch(queue, &self.broker);
        Ok(Subscription::new(queue, receiver.boxed()))
    }

    fn is_open(&self) -> bool {
        self.broker.lock().channels.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        for queue in state.close_channel(self.id) {
            state.dispatch(&queue, &self.broker);
        }
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    channel_id: u64,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.broker.settle(self.channel_id, self.tag, None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.broker.settle(self.channel_id, self.tag, Some(requeue))
    }
}
