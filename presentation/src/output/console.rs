//! Console output for relayed answers

use async_trait::async_trait;
use colored::Colorize;
use relay_application::ports::answer_sink::{AnswerSink, SinkError};
use relay_application::ConsumerStats;
use relay_domain::{AnswerFragment, PromptId};
use std::io::{Stdout, Write};
use std::sync::Mutex;

/// Formats relay events for console display
pub struct ConsoleFormatter;

impl ConsoleFormatter {
    /// One line per fragment: `[<prompt id> #<sequence>] <text>`
    pub fn format_fragment(fragment: &AnswerFragment) -> String {
        let label = format!("[{} #{}]", fragment.prompt_id, fragment.sequence);
        let mut line = format!("{} {}", label.cyan(), fragment.text);
        if fragment.is_final {
            line.push_str(&format!(" {}", "(final)".green().bold()));
        }
        line
    }

    pub fn format_published(prompt_id: &PromptId) -> String {
        format!("{} {}", "Published prompt".bold(), prompt_id)
    }

    pub fn format_cancel_requested(prompt_id: &PromptId) -> String {
        format!("{} {}", "Cancel requested for".yellow().bold(), prompt_id)
    }

    /// Summary printed when a consumer stops
    pub fn format_stats(side: &str, stats: &ConsumerStats) -> String {
        format!(
            "{} {} deliveries, {} resubscriptions",
            format!("{}:", side).dimmed(),
            stats.deliveries,
            stats.resubscriptions
        )
    }

    pub fn header(title: &str) -> String {
        let line = "=".repeat(60);
        format!("{}\n{:^60}\n{}", line.cyan(), title.bold(), line.cyan())
    }
}

/// Sink that prints every fragment as it arrives.
///
/// A console is always there, so the only failure is a broken writer.
pub struct ConsoleAnswerSink<W = Stdout> {
    writer: Mutex<W>,
}

impl ConsoleAnswerSink<Stdout> {
    pub fn stdout() -> Self {
        Self::with_writer(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleAnswerSink<W> {
    pub fn with_writer(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W: Write + Send> AnswerSink for ConsoleAnswerSink<W> {
    async fn deliver(&self, fragment: &AnswerFragment) -> Result<(), SinkError> {
        let line = ConsoleFormatter::format_fragment(fragment);
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| SinkError::Unavailable("console writer poisoned".to_string()))?;
        writeln!(writer, "{}", line)
            .and_then(|_| writer.flush())
            .map_err(|e| SinkError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn fragment(sequence: u64, text: &str, is_final: bool) -> AnswerFragment {
        AnswerFragment::new(PromptId::try_new("p1").unwrap(), sequence, text, is_final)
    }

    #[test]
    fn test_format_fragment() {
        let line = ConsoleFormatter::format_fragment(&fragment(1, "hello", false));
        assert!(line.contains("[p1 #1]"));
        assert!(line.ends_with("hello"));

        let last = ConsoleFormatter::format_fragment(&fragment(2, "bye", true));
        assert!(last.contains("bye"));
        assert!(last.contains("(final)"));
    }

    #[test]
    fn test_format_stats() {
        let stats = ConsumerStats {
            deliveries: 3,
            resubscriptions: 1,
        };
        let line = ConsoleFormatter::format_stats("relay", &stats);
        assert!(line.contains("3 deliveries, 1 resubscriptions"));
    }

    #[tokio::test]
    async fn test_sink_prints_one_line_per_fragment() {
        let buffer = SharedBuffer::default();
        let sink = ConsoleAnswerSink::with_writer(buffer.clone());

        sink.deliver(&fragment(0, "a", false)).await.unwrap();
        sink.deliver(&fragment(1, "b", true)).await.unwrap();

        let output = buffer.contents();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("a"));
        assert!(lines[1].contains("(final)"));
    }

    #[tokio::test]
    async fn test_broken_writer_is_unavailable() {
        let sink = ConsoleAnswerSink::with_writer(BrokenWriter);
        let err = sink.deliver(&fragment(0, "a", false)).await.unwrap_err();
        assert!(matches!(err, SinkError::Unavailable(_)));
    }
}
