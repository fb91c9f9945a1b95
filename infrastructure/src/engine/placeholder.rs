//! Placeholder answer engine.
//!
//! Stands in for a real inference backend: it streams canned fragments
//! with a fixed delay between them, so the whole pipeline can run without
//! one.

use async_trait::async_trait;
use futures::StreamExt;
use relay_application::ports::answer_engine::{AnswerEngine, FragmentStream, GenerationError};
use relay_domain::Prompt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Streams `"This is a fake LLM response {i}"` fragments, or a fixed list.
#[derive(Debug, Clone)]
pub struct PlaceholderEngine {
    fragments: Vec<String>,
    delay: Duration,
    fail_after: Option<usize>,
}

impl PlaceholderEngine {
    /// `count` numbered fragments (1-based), `delay` apart.
    pub fn new(count: usize, delay: Duration) -> Self {
        let fragments = (1..=count)
            .map(|i| format!("This is a fake LLM response {}", i))
            .collect();
        Self {
            fragments,
            delay,
            fail_after: None,
        }
    }

    /// Answer every prompt with exactly `fragments`, without delay.
    pub fn with_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
            fail_after: None,
        }
    }

    /// Fail every generation after `count` fragments.
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }
}

#[async_trait]
impl AnswerEngine for PlaceholderEngine {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<FragmentStream, GenerationError> {
        debug!(
            prompt_id = %prompt.id(),
            fragments = self.fragments.len(),
            "Generating placeholder answer"
        );
        let delay = self.delay;
        let fail_after = self.fail_after;
        let fragments: Arc<[String]> = self.fragments.clone().into();

        let stream = futures::stream::unfold(0usize, move |index| {
            let fragments = Arc::clone(&fragments);
            async move {
                if fail_after == Some(index) {
                    let error = GenerationError::Engine(format!(
                        "placeholder failure after {} fragments",
                        index
                    ));
                    // Past the end, so the stream stops after the error
                    return Some((Err(error), usize::MAX));
                }
                let text = fragments.get(index)?.clone();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Some((Ok(text), index + 1))
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_domain::PromptId;

    fn prompt() -> Prompt {
        Prompt::try_new(PromptId::try_new("p1").unwrap(), "hello").unwrap()
    }

    #[tokio::test]
    async fn yields_numbered_fragments() {
        let engine = PlaceholderEngine::new(3, Duration::ZERO);
        let texts: Vec<String> = engine
            .generate(&prompt())
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(
            texts,
            vec![
                "This is a fake LLM response 1",
                "This is a fake LLM response 2",
                "This is a fake LLM response 3",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_fragments() {
        let engine = PlaceholderEngine::new(2, Duration::from_secs(1));
        let started = tokio::time::Instant::now();
        let count = engine.generate(&prompt()).await.unwrap().count().await;
        assert_eq!(count, 2);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn fails_after_configured_fragments() {
        let engine = PlaceholderEngine::with_fragments(["a", "b", "c"]).failing_after(1);
        let items: Vec<_> = engine.generate(&prompt()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok("a".to_string()));
        assert!(matches!(items[1], Err(GenerationError::Engine(_))));
    }

    #[tokio::test]
    async fn empty_fragment_list_ends_immediately() {
        let engine = PlaceholderEngine::with_fragments(Vec::<String>::new());
        let count = engine.generate(&prompt()).await.unwrap().count().await;
        assert_eq!(count, 0);
        assert_eq!(engine.fragment_count(), 0);
    }
}
