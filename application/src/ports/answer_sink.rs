//! Answer sink port
//!
//! Whatever surfaces answers to the external caller (a live stream to a
//! browser, a console, a log file) receives fragments through this trait.
//! The relay acknowledges a fragment only after `deliver` returned `Ok`.

use async_trait::async_trait;
use relay_domain::AnswerFragment;
use std::sync::Arc;
use thiserror::Error;

/// Errors a sink reports back to the relay
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Cannot take the fragment right now; it will be redelivered.
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    /// Nobody is waiting for this prompt any more; its answer is abandoned.
    #[error("Sink closed for prompt {0}")]
    Closed(String),
}

/// Destination for relayed fragments.
#[async_trait]
pub trait AnswerSink: Send + Sync {
    async fn deliver(&self, fragment: &AnswerFragment) -> Result<(), SinkError>;
}

/// Sink that forwards every fragment to several sinks in order.
///
/// Fails on the first sink that fails; sinks before it have already seen
/// the fragment and will see it again on redelivery.
pub struct FanOutSink {
    sinks: Vec<Arc<dyn AnswerSink>>,
}

impl FanOutSink {
    pub fn new(sinks: Vec<Arc<dyn AnswerSink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl AnswerSink for FanOutSink {
    async fn deliver(&self, fragment: &AnswerFragment) -> Result<(), SinkError> {
        for sink in &self.sinks {
            sink.deliver(fragment).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_domain::PromptId;
    use std::sync::Mutex;

    struct RecordingSink {
        seen: Mutex<Vec<String>>,
        fail: Option<SinkError>,
    }

    #[async_trait]
    impl AnswerSink for RecordingSink {
        async fn deliver(&self, fragment: &AnswerFragment) -> Result<(), SinkError> {
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            self.seen.lock().unwrap().push(fragment.text.clone());
            Ok(())
        }
    }

    fn fragment() -> AnswerFragment {
        AnswerFragment::new(PromptId::try_new("p1").unwrap(), 0, "a", true)
    }

    #[tokio::test]
    async fn fan_out_reaches_every_sink() {
        let a = Arc::new(RecordingSink {
            seen: Mutex::new(vec![]),
            fail: None,
        });
        let b = Arc::new(RecordingSink {
            seen: Mutex::new(vec![]),
            fail: None,
        });
        let sink = FanOutSink::new(vec![a.clone(), b.clone()]);
        sink.deliver(&fragment()).await.unwrap();
        assert_eq!(*a.seen.lock().unwrap(), vec!["a"]);
        assert_eq!(*b.seen.lock().unwrap(), vec!["a"]);
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn fan_out_stops_at_first_failure() {
        let failing = Arc::new(RecordingSink {
            seen: Mutex::new(vec![]),
            fail: Some(SinkError::Unavailable("busy".into())),
        });
        let after = Arc::new(RecordingSink {
            seen: Mutex::new(vec![]),
            fail: None,
        });
        let sink = FanOutSink::new(vec![failing, after.clone()]);
        let err = sink.deliver(&fragment()).await.unwrap_err();
        assert_eq!(err, SinkError::Unavailable("busy".into()));
        assert!(after.seen.lock().unwrap().is_empty());
    }
}
