//! Answer sinks.
//!
//! - [`LiveStreamSink`]: push fragments to clients attached in-process
//! - [`JsonlAnswerSink`]: append fragments to a JSONL file for later polling

mod jsonl;
mod live;

pub use jsonl::JsonlAnswerSink;
pub use live::{AnswerStream, LiveStreamSink};
