//! Process-scoped broker session.
//!
//! One [`BrokerSession`] is created at startup and shared (via `Arc`) by every
//! use case in the process. It owns the single broker connection, caches the
//! publishing channel, and replaces that channel when it breaks. Queue,
//! exchange and binding declarations are remembered and replayed on every
//! fresh channel.

use crate::ports::broker::{BrokerChannel, BrokerConnection, BrokerConnector, BrokerError};
use relay_domain::QueueOptions;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Something declared once and replayed on every new channel.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Declaration {
    Queue { name: String, options: QueueOptions },
    Fanout { name: String, durable: bool },
    Binding { queue: String, exchange: String },
}

impl Declaration {
    fn same_target(&self, other: &Declaration) -> bool {
        match (self, other) {
            (Declaration::Queue { name: a, .. }, Declaration::Queue { name: b, .. }) => a == b,
            (Declaration::Fanout { name: a, .. }, Declaration::Fanout { name: b, .. }) => a == b,
            (a, b) => a == b,
        }
    }

    async fn apply(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        match self {
            Declaration::Queue { name, options } => channel.declare_queue(name, *options).await,
            Declaration::Fanout { name, durable } => channel.declare_fanout(name, *durable).await,
            Declaration::Binding { queue, exchange } => channel.bind_queue(queue, exchange).await,
        }
    }
}

/// Long-lived broker connection plus a reusable publishing channel.
pub struct BrokerSession {
    connection: Arc<dyn BrokerConnection>,
    publish_channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    declarations: StdMutex<Vec<Declaration>>,
}

impl BrokerSession {
    /// Connect once; the caller decides what to do when this fails.
    pub async fn connect(connector: &dyn BrokerConnector, url: &str) -> Result<Self, BrokerError> {
        let connection = connector.connect(url).await?;
        info!("Connected to broker at {}", redact_url(url));
        Ok(Self::from_connection(connection))
    }

    /// Wrap an already established connection.
    pub fn from_connection(connection: Arc<dyn BrokerConnection>) -> Self {
        Self {
            connection,
            publish_channel: Mutex::new(None),
            declarations: StdMutex::new(Vec::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    /// Declare a queue now and on every channel opened later.
    pub async fn declare(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.declare_and_remember(Declaration::Queue {
            name: name.to_string(),
            options,
        })
        .await?;
        debug!(queue = name, durable = options.durable, "Queue declared");
        Ok(())
    }

    /// Declare a fanout exchange now and on every channel opened later.
    pub async fn declare_fanout(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.declare_and_remember(Declaration::Fanout {
            name: name.to_string(),
            durable,
        })
        .await?;
        debug!(exchange = name, durable, "Fanout exchange declared");
        Ok(())
    }

    /// Bind `queue` to the fanout `exchange`, now and on every later channel.
    pub async fn bind(&self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        self.declare_and_remember(Declaration::Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
        })
        .await?;
        debug!(queue, exchange, "Queue bound");
        Ok(())
    }

    /// Publish on the shared channel.
    ///
    /// A broken channel is dropped so the next call opens a fresh one; the
    /// failed publish itself is reported, not retried.
    pub async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.on_publish_channel(|channel| async move {
            channel.publish(queue, payload).await
        })
        .await
    }

    /// Broadcast on the shared channel to every queue bound to `exchange`.
    pub async fn broadcast(&self, exchange: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.on_publish_channel(|channel| async move {
            channel.broadcast(exchange, payload).await
        })
        .await
    }

    /// Open a dedicated channel for a consumer, with every known queue
    /// declared and the prefetch applied.
    pub async fn consumer_channel(
        &self,
        prefetch: u16,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.open_declared_channel().await?;
        channel.set_prefetch(prefetch).await?;
        Ok(channel)
    }

    /// Close the publishing channel and the connection.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        if let Some(channel) = self.publish_channel.lock().await.take()
            && channel.is_open()
            && let Err(e) = channel.close().await
        {
            warn!("Failed to close publishing channel: {}", e);
        }
        if self.connection.is_open() {
            self.connection.close().await?;
        }
        info!("Broker session closed");
        Ok(())
    }

    async fn declare_and_remember(&self, declaration: Declaration) -> Result<(), BrokerError> {
        let applied = declaration.clone();
        self.on_publish_channel(|channel| async move { applied.apply(channel.as_ref()).await })
            .await?;
        self.remember(declaration);
        Ok(())
    }

    /// Run `operation` on the publishing channel, discarding the channel
    /// when the operation broke it.
    async fn on_publish_channel<F, Fut>(&self, operation: F) -> Result<(), BrokerError>
    where
        F: FnOnce(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = Result<(), BrokerError>>,
    {
        let mut slot = self.publish_channel.lock().await;
        let channel = self.live_channel(&mut slot).await?;
        match operation(channel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                Self::discard_if_broken(&mut slot, &e);
                Err(e)
            }
        }
    }

    async fn live_channel(
        &self,
        slot: &mut Option<Arc<dyn BrokerChannel>>,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if let Some(channel) = slot.as_ref()
            && channel.is_open()
        {
            return Ok(Arc::clone(channel));
        }
        if slot.take().is_some() {
            debug!("Publishing channel closed, opening a new one");
        }
        let channel = self.open_declared_channel().await?;
        *slot = Some(Arc::clone(&channel));
        Ok(channel)
    }

    async fn open_declared_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.connection.is_open() {
            return Err(BrokerError::Connection("connection is closed".to_string()));
        }
        let channel = self.connection.open_channel().await?;
        for declaration in self.declared() {
            declaration.apply(channel.as_ref()).await?;
        }
        Ok(channel)
    }

    fn discard_if_broken(slot: &mut Option<Arc<dyn BrokerChannel>>, error: &BrokerError) {
        let broken = matches!(error, BrokerError::Channel(_) | BrokerError::QueueConflict { .. })
            || slot.as_ref().is_some_and(|c| !c.is_open());
        if broken && slot.take().is_some() {
            warn!("Discarding publishing channel after error: {}", error);
        }
    }

    /// Later declarations of the same queue or exchange replace earlier
    /// ones. Order is kept, so bindings replay after their targets.
    fn remember(&self, declaration: Declaration) {
        let mut declarations = self.declarations.lock().unwrap_or_else(|e| e.into_inner());
        match declarations.iter_mut().find(|d| d.same_target(&declaration)) {
            Some(entry) => *entry = declaration,
            None => declarations.push(declaration),
        }
    }

    fn declared(&self) -> Vec<Declaration> {
        self.declarations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Hide credentials in a broker URL before logging it.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{}://***@{}", scheme, host),
        None => url.to_string(),
    }
}
