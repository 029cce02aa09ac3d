//! Incremental `text/event-stream` decoding and completion frame parsing.

use std::mem;

use serde_json::Value;
use thiserror::Error;

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct PendingEvent {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry_ms: Option<u64>,
}

/// Splits an arbitrarily chunked byte stream into events. Lines may be split
/// across chunks, including in the middle of a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    pending: PendingEvent,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a trailing event when the stream closes without a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r').to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.pending.data.push(value.to_string()),
            "event" => self.pending.event = Some(value.to_string()),
            "id" if !value.contains('\0') => self.pending.id = Some(value.to_string()),
            "retry" => {
                if let Ok(retry_ms) = value.parse::<u64>() {
                    self.pending.retry_ms = Some(retry_ms);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let pending = mem::take(&mut self.pending);
        if pending.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: pending.event,
            data: pending.data.join("\n"),
            id: pending.id,
            retry_ms: pending.retry_ms,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionFrame {
    Delta(String),
    Done,
    /// Well-formed frame carrying no text.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame_json_invalid:{0}")]
    InvalidJson(String),
    #[error("frame_not_object")]
    NotAnObject,
}

/// Reads the `data` of one completion event.
///
/// Accepts `{"content": "..."}` and the chunk shape
/// `{"choices":[{"delta":{"content":"..."}}]}`.
pub fn parse_completion_frame(data: &str) -> Result<CompletionFrame, FrameError> {
    let trimmed = data.trim();
    if trimmed == DONE_SENTINEL {
        return Ok(CompletionFrame::Done);
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|error| FrameError::InvalidJson(error.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(FrameError::NotAnObject);
    };

    let text = object
        .get("content")
        .and_then(Value::as_str)
        .or_else(|| {
            object
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|choices| choices.first())
                .and_then(|choice| choice.get("delta"))
                .and_then(|delta| delta.get("content"))
                .and_then(Value::as_str)
        });

    match text {
        Some(text) if !text.is_empty() => Ok(CompletionFrame::Delta(text.to_string())),
        _ => Ok(CompletionFrame::Empty),
    }
}
