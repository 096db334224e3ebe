//! Incremental decoder for the chat backend's event stream.
//!
//! The backend sends `data: <json>` lines. Two payload shapes occur:
//! OpenAI-style chunks with `choices[0].delta.content`, and Claude Messages
//! events (`content_block_delta`, `message_stop`, `error`). `data: [DONE]`
//! ends either kind of stream.
//!
//! Bytes are buffered until a full line is available, so multi-byte
//! characters split across network chunks decode correctly.

use serde_json::Value;
use tracing::{debug, warn};

use crate::utils::truncate_string;

/// Longest undecodable line kept in a log message.
const MAX_LOGGED_LINE_CHARS: usize = 200;

/// One decoded stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A non-empty text increment.
    Delta(String),
    /// The backend finished the reply.
    Done,
    /// The backend reported an error inside the stream.
    Error(String),
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns events for every complete line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            if let Some(event) = decode_line(&self.buffer[start..end]) {
                events.push(event);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        events
    }

    /// Decode whatever is left once the connection has closed.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(raw: &[u8]) -> Option<SseEvent> {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line.trim_end_matches('\r'),
        Err(e) => {
            warn!(error = %e, "Skipping stream line with invalid UTF-8");
            return None;
        }
    };

    // Blank separators, comments, and `event:` names carry nothing we need;
    // Claude events repeat their type inside the JSON.
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let chunk: Value = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(
                error = %e,
                line = %truncate_string(data, MAX_LOGGED_LINE_CHARS),
                "Skipping malformed stream chunk"
            );
            return None;
        }
    };

    match chunk.get("type").and_then(Value::as_str) {
        Some(kind) => decode_claude(kind, &chunk),
        None => decode_openai(&chunk),
    }
}

fn decode_openai(chunk: &Value) -> Option<SseEvent> {
    if let Some(error) = chunk.get("error") {
        return Some(SseEvent::Error(error_message(error)));
    }
    let text = chunk
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()?;
    (!text.is_empty()).then(|| SseEvent::Delta(text.to_string()))
}

fn decode_claude(kind: &str, chunk: &Value) -> Option<SseEvent> {
    match kind {
        "content_block_delta" => {
            let delta = chunk.get("delta")?;
            if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                return None;
            }
            let text = delta.get("text")?.as_str()?;
            (!text.is_empty()).then(|| SseEvent::Delta(text.to_string()))
        }
        "message_stop" => Some(SseEvent::Done),
        "error" => Some(SseEvent::Error(
            chunk
                .get("error")
                .map(error_message)
                .unwrap_or_else(|| "unknown_error".to_string()),
        )),
        other => {
            debug!(event = other, "Ignoring stream event");
            None
        }
    }
}

fn error_message(error: &Value) -> String {
    let kind = error.get("type").and_then(Value::as_str);
    let message = error.get("message").and_then(Value::as_str);
    match (kind, message) {
        (Some(kind), Some(message)) => format!("{}: {}", kind, message),
        (None, Some(message)) => message.to_string(),
        (Some(kind), None) => kind.to_string(),
        (None, None) => error.to_string(),
    }
}
