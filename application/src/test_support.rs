//! Test doubles shared by the use case tests.

use crate::ports::answer_engine::{AnswerEngine, FragmentStream, GenerationError};
use crate::ports::answer_sink::{AnswerSink, SinkError};
use crate::ports::broker::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerError, Delivery, Subscription,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use relay_domain::{AnswerFragment, Prompt, QueueOptions};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    Reject,
}

type DeliverySender = UnboundedSender<Result<Delivery, BrokerError>>;

struct FakeState {
    connection_open: bool,
    channels_opened: usize,
    generation: u64,
    published: HashMap<String, Vec<Vec<u8>>>,
    declarations: HashMap<String, usize>,
    bindings: Vec<(String, String)>,
    publish_attempts: usize,
    publish_budget: Option<usize>,
    settlements: Vec<(u64, Settlement)>,
    subscribers: HashMap<String, DeliverySender>,
    backlog: HashMap<String, VecDeque<Delivery>>,
}

/// Scriptable in-process broker with inspection helpers.
#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                connection_open: true,
                channels_opened: 0,
                generation: 0,
                published: HashMap::new(),
                declarations: HashMap::new(),
                bindings: Vec::new(),
                publish_attempts: 0,
                publish_budget: None,
                settlements: Vec::new(),
                subscribers: HashMap::new(),
                backlog: HashMap::new(),
            })),
        }
    }

    pub fn connection(&self) -> Arc<dyn BrokerConnection> {
        Arc::new(FakeConnection {
            state: Arc::clone(&self.state),
        })
    }

    pub fn channels_opened(&self) -> usize {
        self.lock().channels_opened
    }

    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock().published.get(queue).cloned().unwrap_or_default()
    }

    pub fn declarations(&self, queue: &str) -> usize {
        self.lock().declarations.get(queue).copied().unwrap_or(0)
    }

    /// Every `(queue, exchange)` binding applied, in order.
    pub fn bindings(&self) -> Vec<(String, String)> {
        self.lock().bindings.clone()
    }

    /// Every existing channel fails its next operation and closes.
    pub fn break_channels(&self) {
        self.lock().generation += 1;
    }

    /// Publishes after the first `n` attempts fail.
    pub fn fail_publishes_after(&self, n: usize) {
        self.lock().publish_budget = Some(n);
    }

    /// A delivery whose settlement is recorded under `tag`.
    pub fn delivery(&self, payload: Vec<u8>, tag: u64) -> Delivery {
        Delivery::new(
            payload,
            tag,
            false,
            Box::new(FakeAcker {
                state: Arc::clone(&self.state),
                tag,
            }),
        )
    }

    /// Hand a delivery to the consumer of `queue`, or keep it until one
    /// subscribes.
    pub fn push(&self, queue: &str, payload: &[u8], tag: u64) {
        let delivery = self.delivery(payload.to_vec(), tag);
        let mut state = self.lock();
        match state.subscribers.get(queue) {
            Some(sender) if !sender.is_closed() => {
                let _ = sender.unbounded_send(Ok(delivery));
            }
            _ => state
                .backlog
                .entry(queue.to_string())
                .or_default()
                .push_back(delivery),
        }
    }

    /// Fail every active subscription with a channel error.
    pub fn fail_subscriptions(&self) {
        let mut state = self.lock();
        for (_, sender) in state.subscribers.drain() {
            let _ = sender.unbounded_send(Err(BrokerError::Channel("consumer cancelled".into())));
        }
    }

    pub fn settlements(&self) -> Vec<(u64, Settlement)> {
        self.lock().settlements.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

struct FakeConnection {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.state.lock().unwrap();
        if !state.connection_open {
            return Err(BrokerError::Channel("connection closed".into()));
        }
        state.channels_opened += 1;
        Ok(Arc::new(FakeChannel {
            state: Arc::clone(&self.state),
            generation: state.generation,
            open: AtomicBool::new(true),
        }))
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().connection_open
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.connection_open = false;
        state.subscribers.clear();
        Ok(())
    }
}

struct FakeChannel {
    state: Arc<Mutex<FakeState>>,
    generation: u64,
    open: AtomicBool,
}

impl FakeChannel {
    fn record_publish(&self, target: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;
        state.publish_attempts += 1;
        if state
            .publish_budget
            .is_some_and(|budget| state.publish_attempts > budget)
        {
            return Err(BrokerError::Publish("nacked".into()));
        }
        state
            .published
            .entry(target.to_string())
            .or_default()
            .push(payload.to_vec());
        Ok(())
    }

    fn check(&self, state: &FakeState) -> Result<(), BrokerError> {
        if !self.open.load(Ordering::SeqCst) || !state.connection_open {
            return Err(BrokerError::Channel("channel closed".into()));
        }
        if self.generation < state.generation {
            self.open.store(false, Ordering::SeqCst);
            return Err(BrokerError::Channel("channel broken".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare_queue(&self, name: &str, _options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;
        *state.declarations.entry(name.to_string()).or_default() += 1;
        Ok(())
    }

    async fn declare_fanout(&self, exchange: &str, _durable: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;
        *state.declarations.entry(exchange.to_string()).or_default() += 1;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;
        state
            .bindings
            .push((queue.to_string(), exchange.to_string()));
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.record_publish(queue, payload)
    }

    /// Recorded under the exchange name.
    async fn broadcast(&self, exchange: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.record_publish(exchange, payload)
    }

    async fn set_prefetch(&self, _count: u16) -> Result<(), BrokerError> {
        self.check(&self.state.lock().unwrap())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<Subscription, BrokerError> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;
        let (sender, receiver) = unbounded();
        for delivery in state.backlog.remove(queue).unwrap_or_default() {
            let _ = sender.unbounded_send(Ok(delivery));
        }
        state.subscribers.insert(queue.to_string(), sender);
        Ok(Subscription::new(queue, receiver.boxed()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.state.lock().unwrap().connection_open
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeAcker {
    state: Arc<Mutex<FakeState>>,
    tag: u64,
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.state
            .lock()
            .unwrap()
            .settlements
            .push((self.tag, Settlement::Ack));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let settlement = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Reject
        };
        self.state
            .lock()
            .unwrap()
            .settlements
            .push((self.tag, settlement));
        Ok(())
    }
}

/// Engine that replays a fixed answer, optionally failing the first calls.
pub struct ScriptedEngine {
    fragments: Vec<String>,
    fail_after: Option<usize>,
    failing_calls: usize,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            fail_after: None,
            failing_calls: 0,
            calls: AtomicUsize::new(0),
        }
    }

    /// The first `times` calls fail after `fragments` texts; with zero
    /// fragments `generate` itself fails.
    pub fn failing_after(mut self, fragments: usize, times: usize) -> Self {
        self.fail_after = Some(fragments);
        self.failing_calls = times;
        self
    }
}

#[async_trait]
impl AnswerEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _prompt: &Prompt) -> Result<FragmentStream, GenerationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut items: Vec<Result<String, GenerationError>> =
            self.fragments.iter().cloned().map(Ok).collect();

        if let Some(after) = self.fail_after
            && call < self.failing_calls
        {
            if after == 0 {
                return Err(GenerationError::Unavailable("scripted outage".into()));
            }
            items.truncate(after);
            items.push(Err(GenerationError::Engine("scripted failure".into())));
        }
        Ok(futures::stream::iter(items).boxed())
    }
}

/// Sink that records what it accepted, with switchable failures.
#[derive(Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<String>>,
    unavailable: AtomicBool,
    closed: Mutex<HashSet<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepted fragments, formatted as `prompt#sequence`.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Report the client of `prompt_id` as gone.
    pub fn close_prompt(&self, prompt_id: &str) {
        self.closed.lock().unwrap().insert(prompt_id.to_string());
    }
}

#[async_trait]
impl AnswerSink for RecordingSink {
    async fn deliver(&self, fragment: &AnswerFragment) -> Result<(), SinkError> {
        if self.closed.lock().unwrap().contains(fragment.prompt_id.as_str()) {
            return Err(SinkError::Closed(format!("{} left", fragment.prompt_id)));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("busy".into()));
        }
        self.seen.lock().unwrap().push(fragment.to_string());
        Ok(())
    }
}
