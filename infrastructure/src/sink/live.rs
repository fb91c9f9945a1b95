//! Push delivery to attached clients.
//!
//! A client calls [`LiveStreamSink::attach`] for the prompt it waits on and
//! reads fragments from the returned [`AnswerStream`]. The stream ends after
//! the final fragment. Dropping it tells the relay the client went away.

use async_trait::async_trait;
use relay_application::ports::answer_sink::{AnswerSink, SinkError};
use relay_domain::{AnswerFragment, PromptId};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Receiving end handed to a client.
pub struct AnswerStream {
    prompt_id: PromptId,
    receiver: mpsc::Receiver<AnswerFragment>,
}

impl AnswerStream {
    pub fn prompt_id(&self) -> &PromptId {
        &self.prompt_id
    }

    /// Next fragment; `None` after the final fragment.
    pub async fn next(&mut self) -> Option<AnswerFragment> {
        self.receiver.recv().await
    }

    /// Wait for the whole answer.
    pub async fn collect(mut self) -> Vec<AnswerFragment> {
        let mut fragments = Vec::new();
        while let Some(fragment) = self.next().await {
            fragments.push(fragment);
        }
        fragments
    }
}

/// Sink that pushes fragments into bounded per-prompt channels.
pub struct LiveStreamSink {
    streams: Mutex<HashMap<PromptId, mpsc::Sender<AnswerFragment>>>,
    capacity: usize,
}

impl LiveStreamSink {
    /// `capacity` is the number of fragments buffered per client before
    /// the sink reports itself unavailable.
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Start receiving the answer to `prompt_id`. Attaching again replaces
    /// the previous stream.
    pub fn attach(&self, prompt_id: PromptId) -> AnswerStream {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.lock().insert(prompt_id.clone(), sender);
        debug!(prompt_id = %prompt_id, "Client attached");
        AnswerStream {
            prompt_id,
            receiver,
        }
    }

    /// Number of clients still waiting on an answer.
    pub fn attached(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PromptId, mpsc::Sender<AnswerFragment>>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AnswerSink for LiveStreamSink {
    async fn deliver(&self, fragment: &AnswerFragment) -> Result<(), SinkError> {
        let mut streams = self.lock();
        let Some(sender) = streams.get(&fragment.prompt_id) else {
            return Err(SinkError::Unavailable(format!(
                "no client attached for {}",
                fragment.prompt_id
            )));
        };
        match sender.try_send(fragment.clone()) {
            Ok(()) => {
                if fragment.is_final {
                    // Dropping the sender ends the client's stream
                    streams.remove(&fragment.prompt_id);
                }
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(SinkError::Unavailable(format!(
                "client for {} is not keeping up",
                fragment.prompt_id
            ))),
            Err(TrySendError::Closed(_)) => {
                streams.remove(&fragment.prompt_id);
                Err(SinkError::Closed(format!(
                    "client for {} went away",
                    fragment.prompt_id
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PromptId {
        PromptId::try_new(s).unwrap()
    }

    #[tokio::test]
    async fn attached_client_receives_until_final() {
        let sink = LiveStreamSink::new(4);
        let stream = sink.attach(id("p1"));
        sink.deliver(&AnswerFragment::new(id("p1"), 0, "a", false))
            .await
            .unwrap();
        sink.deliver(&AnswerFragment::new(id("p1"), 1, "b", true))
            .await
            .unwrap();
        assert_eq!(sink.attached(), 0);

        let texts: Vec<String> = stream.collect().await.into_iter().map(|f| f.text).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn missing_client_is_unavailable() {
        let sink = LiveStreamSink::new(4);
        let err = sink
            .deliver(&AnswerFragment::new(id("p1"), 0, "a", false))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Unavailable(_)));
    }

    #[tokio::test]
    async fn full_stream_is_unavailable() {
        let sink = LiveStreamSink::new(1);
        let _stream = sink.attach(id("p1"));
        sink.deliver(&AnswerFragment::new(id("p1"), 0, "a", false))
            .await
            .unwrap();
        let err = sink
            .deliver(&AnswerFragment::new(id("p1"), 1, "b", false))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Unavailable(_)));
    }

    #[tokio::test]
    async fn dropped_client_is_closed() {
        let sink = LiveStreamSink::new(4);
        drop(sink.attach(id("p1")));
        let err = sink
            .deliver(&AnswerFragment::new(id("p1"), 0, "a", false))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Closed(_)));
        assert_eq!(sink.attached(), 0);
    }
}
