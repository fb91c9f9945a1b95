//! Cancellation of abandoned generations.
//!
//! The relay broadcasts a cancel request when the client waiting for a
//! prompt goes away. Every generator process runs a [`CancelListener`] on a
//! private queue bound to the cancel exchange, so each process sees every
//! request and trips the matching token in its [`CancellationRegistry`],
//! which the generator checks between fragments.

use crate::config::{ConsumerParams, QueueTopology};
use crate::ports::broker::{BrokerError, Delivery};
use crate::session::BrokerSession;
use crate::use_cases::consume::{ConsumerStats, DeliveryHandler, run_consumer};
use async_trait::async_trait;
use relay_domain::{PromptId, QueueOptions};
use relay_domain::wire::decode_cancel;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Default)]
struct RegistryState {
    active: HashMap<PromptId, CancellationToken>,
    early: VecDeque<PromptId>,
    early_set: HashSet<PromptId>,
}

/// In-flight generations by prompt id.
pub struct CancellationRegistry {
    state: Mutex<RegistryState>,
    early_capacity: usize,
}

impl CancellationRegistry {
    /// `early_capacity` bounds how many cancels for prompts that have not
    /// started yet are remembered.
    pub fn new(early_capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            early_capacity,
        }
    }

    /// Register a generation and get its token. The token is already
    /// cancelled when a cancel for this prompt arrived earlier.
    pub fn begin(&self, prompt_id: &PromptId) -> CancellationToken {
        let mut state = self.lock();
        let token = CancellationToken::new();
        if state.early_set.remove(prompt_id) {
            state.early.retain(|id| id != prompt_id);
            token.cancel();
        }
        state.active.insert(prompt_id.clone(), token.clone());
        token
    }

    /// Unregister a generation once its message is settled.
    pub fn finish(&self, prompt_id: &PromptId) {
        self.lock().active.remove(prompt_id);
    }

    /// Cancel a generation. Returns `true` when it was in flight; otherwise
    /// the request is remembered for when the prompt arrives.
    pub fn cancel(&self, prompt_id: &PromptId) -> bool {
        let mut state = self.lock();
        if let Some(token) = state.active.get(prompt_id) {
            token.cancel();
            return true;
        }
        if self.early_capacity > 0 && state.early_set.insert(prompt_id.clone()) {
            state.early.push_back(prompt_id.clone());
            while state.early.len() > self.early_capacity {
                if let Some(evicted) = state.early.pop_front() {
                    state.early_set.remove(&evicted);
                }
            }
        }
        false
    }

    pub fn in_flight(&self) -> usize {
        self.lock().active.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Consumes cancel requests and forwards them to the registry.
pub struct CancelListener {
    session: Arc<BrokerSession>,
    registry: Arc<CancellationRegistry>,
    topology: QueueTopology,
    params: ConsumerParams,
    queue: String,
}

impl CancelListener {
    pub fn new(
        session: Arc<BrokerSession>,
        registry: Arc<CancellationRegistry>,
        topology: QueueTopology,
    ) -> Self {
        let queue = format!("{}.{}", topology.cancel_exchange, Uuid::new_v4().simple());
        Self {
            session,
            registry,
            topology,
            params: ConsumerParams::default().with_consumer_tag("cancel-listener"),
            queue,
        }
    }

    pub fn with_params(mut self, params: ConsumerParams) -> Self {
        self.params = params;
        self
    }

    /// Name of this listener's private queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Declare the private queue, bind it to the cancel exchange and consume
    /// it until `shutdown` fires. The session replays both on every channel,
    /// so the queue comes back after the broker removed it.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<ConsumerStats, BrokerError> {
        self.session
            .declare(&self.queue, QueueOptions::exclusive())
            .await?;
        self.session
            .bind(&self.queue, &self.topology.cancel_exchange)
            .await?;
        info!(
            queue = %self.queue,
            exchange = %self.topology.cancel_exchange,
            "Cancel listener started"
        );
        run_consumer(&self.session, &self.queue, &self.params, self, shutdown).await
    }
}

#[async_trait]
impl DeliveryHandler for CancelListener {
    async fn handle(&self, delivery: Delivery) -> Result<(), BrokerError> {
        match decode_cancel(delivery.payload()) {
            Ok(prompt_id) => {
                if self.registry.cancel(&prompt_id) {
                    info!(prompt_id = %prompt_id, "Cancelling in-flight generation");
                } else {
                    debug!(prompt_id = %prompt_id, "Cancel recorded for pending prompt");
                }
                delivery.ack().await
            }
            Err(e) => {
                error!(tag = delivery.delivery_tag(), "Rejecting cancel request: {}", e);
                delivery.reject().await
            }
        }
    }
}
