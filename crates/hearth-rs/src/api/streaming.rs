//! Client-facing stream events.
//!
//! A running turn produces a sequence of [`StreamEvent`] values. The
//! transport writes each one as a single line of JSON (NDJSON); the
//! `"type"` field discriminates variants. The synthetic
//! [`StreamEvent::Keepalive`] variant is produced only by the
//! [`keepalive`](super::keepalive) multiplexer.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::keepalive::KeepaliveEvent;
use crate::suspension::QuestionItem;

/// A single event emitted to the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A turn has been accepted for this thread.
    TurnStarted { thread_id: String },
    /// Assistant text.
    TextDelta { text: String },
    /// A tool is about to execute.
    ToolStarted { call_id: String, name: String },
    /// A tool finished executing.
    ToolCompleted { call_id: String, name: String },
    /// The turn is suspended until these questions are answered.
    QuestionGroup {
        group_id: String,
        questions: Vec<QuestionItem>,
    },
    /// Older history was folded into a summary before this round.
    Compacted { replaced_items: usize },
    /// Token usage reported by the provider for one round.
    Usage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// The turn finished cleanly.
    TurnCompleted { thread_id: String, rounds: u32 },
    /// The turn failed. Always the last event of a stream.
    Error { message: String },
    /// Synthetic heartbeat injected while the real stream is quiet.
    Keepalive { text: String },
}

impl StreamEvent {
    pub fn is_keepalive(&self) -> bool {
        matches!(self, StreamEvent::Keepalive { .. })
    }

    /// Serialize as one NDJSON line (including the trailing newline).
    pub fn to_ndjson_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => {
                warn!("Failed to serialize stream event: {e}");
                "{\"type\":\"error\",\"message\":\"unserializable event\"}\n".to_string()
            }
        }
    }
}

impl KeepaliveEvent for StreamEvent {
    fn keepalive(text: &str) -> Self {
        StreamEvent::Keepalive {
            text: text.to_string(),
        }
    }
}

/// Concatenate the assistant text carried by a sequence of events.
pub fn collect_text(events: &[StreamEvent]) -> String {
    let mut text = String::new();
    for event in events {
        if let StreamEvent::TextDelta { text: delta } = event {
            text.push_str(delta);
        }
    }
    text
}
