//! Text extraction from the agent's `stream-json` output.
//!
//! Each stdout line is one JSON message. The readable text of a message may
//! live in several places depending on its type, so every known location is
//! collected:
//!
//! ```text
//! {"type":"assistant","message":{"content":[{"type":"text","text":"..."}]}}
//! {"type":"content_block_delta","delta":{"text":"..."}}
//! {"type":"result","result":"..."}
//! {"text":"..."}
//! ```
//!
//! Lines that are not JSON are taken verbatim.

use serde::Deserialize;
use serde_json::Value;

/// The parts of a stream message that carry text. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    text: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    message: Option<MessageBody>,
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageBody {
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    text: Option<Value>,
}

fn as_text(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// All text chunks of one JSON stream message, in field order.
pub fn text_chunks(value: &Value) -> Vec<String> {
    let Ok(msg) = StreamMessage::deserialize(value) else {
        return Vec::new();
    };

    let mut chunks = Vec::new();
    if let Some(text) = as_text(msg.text.as_ref()) {
        chunks.push(text.to_string());
    }
    if let Some(result) = as_text(msg.result.as_ref()) {
        chunks.push(result.to_string());
    }
    if let Some(Value::Array(blocks)) = msg.message.and_then(|m| m.content) {
        chunks.extend(
            blocks
                .iter()
                .filter_map(|b| as_text(b.get("text")))
                .map(str::to_string),
        );
    }
    if let Some(text) = as_text(msg.delta.as_ref().and_then(|d| d.text.as_ref())) {
        chunks.push(text.to_string());
    }
    chunks
}

/// Readable text of one output line, or `None` when there is none.
pub fn extract_text(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => {
            let joined = text_chunks(&value).join("\n");
            let joined = joined.trim();
            (!joined.is_empty()).then(|| joined.to_string())
        }
        Ok(_) | Err(_) => Some(line.to_string()),
    }
}

/// Accumulates the text of a whole agent run.
#[derive(Debug, Default)]
pub struct TextCollector {
    chunks: Vec<String>,
}

impl TextCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout line; returns the text it contributed.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let text = extract_text(line)?;
        self.chunks.push(text.clone());
        Some(text)
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn finish(self) -> String {
        self.chunks.join("\n").trim().to_string()
    }
}
