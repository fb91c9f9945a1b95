//! JSONL file sink for answer fragments.
//!
//! Each fragment is appended as one JSON line with a `timestamp`, so a
//! poller can tail the file for the answers it waits on.

use async_trait::async_trait;
use relay_application::ports::answer_sink::{AnswerSink, SinkError};
use relay_domain::AnswerFragment;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Appends one JSON object per fragment.
///
/// Thread-safe via `Mutex<BufWriter<File>>`. Flushes after every line and
/// on `Drop`.
pub struct JsonlAnswerSink {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl JsonlAnswerSink {
    /// Open `path` for appending, creating it (and parent directories) if
    /// needed.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Get the path to the answer file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AnswerSink for JsonlAnswerSink {
    async fn deliver(&self, fragment: &AnswerFragment) -> Result<(), SinkError> {
        let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let record = serde_json::json!({
            "timestamp": timestamp,
            "promptId": fragment.prompt_id,
            "sequence": fragment.sequence,
            "text": fragment.text,
            "isFinal": fragment.is_final,
        });

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| SinkError::Unavailable("answer log writer poisoned".to_string()))?;
        writeln!(writer, "{}", record)
            .and_then(|_| writer.flush())
            .map_err(|e| {
                warn!("Could not append to {}: {}", self.path.display(), e);
                SinkError::Unavailable(e.to_string())
            })
    }
}

impl Drop for JsonlAnswerSink {
    fn drop(&mut self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_domain::PromptId;

    #[tokio::test]
    async fn test_jsonl_sink_writes_one_line_per_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("answers").join("p1.jsonl");
        let sink = JsonlAnswerSink::open(&path).unwrap();
        let id = PromptId::try_new("p1").unwrap();

        sink.deliver(&AnswerFragment::new(id.clone(), 0, "Hello", false))
            .await
            .unwrap();
        sink.deliver(&AnswerFragment::new(id, 1, "world", true))
            .await
            .unwrap();
        drop(sink);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["promptId"], "p1");
        assert_eq!(lines[0]["sequence"], 0);
        assert_eq!(lines[0]["isFinal"], false);
        assert_eq!(lines[1]["text"], "world");
        assert_eq!(lines[1]["isFinal"], true);
        assert!(lines.iter().all(|l| l.get("timestamp").is_some()));
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("answers.jsonl");
        let id = PromptId::try_new("p1").unwrap();

        for sequence in 0..2 {
            let sink = JsonlAnswerSink::open(&path).unwrap();
            sink.deliver(&AnswerFragment::new(id.clone(), sequence, "x", false))
                .await
                .unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
