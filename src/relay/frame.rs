//! Incremental decoding of a provider's streaming response.
//!
//! Bytes arrive in arbitrary pieces. Complete lines are cut from a pending
//! byte buffer; everything after the last newline waits for the next read,
//! so neither a frame nor a UTF-8 sequence can be torn by a read boundary.
//! Each line is either an SSE `data:` line or a bare JSON line (NDJSON).

use serde::Deserialize;
use std::collections::VecDeque;

use crate::error::{RagError, Result};

/// Payload that ends a stream in SSE dialects.
pub const DONE_MARKER: &str = "[DONE]";

/// A decoded, normalized frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Incremental text to append and forward.
    Delta(String),
    /// The provider finished the completion.
    Done,
    /// The provider reported an error in-band.
    Error(String),
}

// ─── Wire shapes ─────────────────────────────────────────

/// Closed set of frame payloads. Variant order matters: serde tries them
/// top to bottom.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireFrame {
    Error { error: WireError },
    OpenAi { choices: Vec<OpenAiChoice> },
    Ollama {
        message: OllamaMessage,
        #[serde(default)]
        done: bool,
    },
    OllamaDone { done: bool },
    Content { content: String },
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireError {
    Text(String),
    Object { message: String },
}

#[derive(Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

/// Decode one line into zero or more frames. An empty result means the line
/// carries nothing (blank line, SSE comment, role-only delta).
pub fn decode_line(line: &str) -> Result<Vec<Frame>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(Vec::new());
    }

    let payload = if let Some(data) = line.strip_prefix("data:") {
        data.trim()
    } else if ["event:", "id:", "retry:"].iter().any(|p| line.starts_with(p)) {
        return Ok(Vec::new());
    } else {
        line
    };

    if payload.is_empty() {
        return Ok(Vec::new());
    }
    if payload == DONE_MARKER {
        return Ok(vec![Frame::Done]);
    }

    let wire: WireFrame = serde_json::from_str(payload)
        .map_err(|e| RagError::Decode(format!("unrecognized frame {payload:?}: {e}")))?;

    let mut frames = Vec::new();
    match wire {
        WireFrame::Error { error } => {
            let message = match error {
                WireError::Text(s) => s,
                WireError::Object { message } => message,
            };
            frames.push(Frame::Error(message));
        }
        WireFrame::OpenAi { choices } => {
            if let Some(choice) = choices.into_iter().next() {
                push_delta(&mut frames, choice.delta.content.unwrap_or_default());
                if choice.finish_reason.is_some() {
                    frames.push(Frame::Done);
                }
            }
        }
        WireFrame::Ollama { message, done } => {
            push_delta(&mut frames, message.content);
            if done {
                frames.push(Frame::Done);
            }
        }
        WireFrame::OllamaDone { done } => {
            if done {
                frames.push(Frame::Done);
            }
        }
        WireFrame::Content { content } | WireFrame::Text(content) => {
            push_delta(&mut frames, content);
        }
    }
    Ok(frames)
}

fn push_delta(frames: &mut Vec<Frame>, content: String) {
    if !content.is_empty() {
        frames.push(Frame::Delta(content));
    }
}

// ─── Incremental decoder ─────────────────────────────────

/// Pull-based frame iterator over an arbitrarily split byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    ready: VecDeque<Frame>,
    max_pending: usize,
}

impl FrameDecoder {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: Vec::new(),
            ready: VecDeque::new(),
            max_pending,
        }
    }

    /// Buffer another read. Fails once the bytes after the last newline
    /// exceed the pending cap; the oversized tail is dropped but complete
    /// lines before it stay decodable.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(bytes);
        let incomplete = match self.pending.iter().rposition(|b| *b == b'\n') {
            Some(pos) => self.pending.len() - pos - 1,
            None => self.pending.len(),
        };
        if incomplete > self.max_pending {
            self.pending.truncate(self.pending.len() - incomplete);
            return Err(RagError::terminal(format!(
                "provider sent {incomplete} bytes without a frame delimiter (limit {})",
                self.max_pending
            )));
        }
        Ok(())
    }

    /// Treat whatever is left in the buffer as a final line. Call once the
    /// provider closes the stream.
    pub fn finish(&mut self) {
        if !self.pending.is_empty() && self.pending.last() != Some(&b'\n') {
            self.pending.push(b'\n');
        }
    }

    /// Next decoded frame, `None` when more bytes are needed. A malformed
    /// line yields `Some(Err(Decode))` and decoding continues with the next.
    pub fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(Ok(frame));
            }

            let newline = self.pending.iter().position(|b| *b == b'\n')?;
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = match std::str::from_utf8(&raw) {
                Ok(s) => s,
                Err(e) => return Some(Err(RagError::Decode(format!("frame is not UTF-8: {e}")))),
            };

            match decode_line(line) {
                Ok(frames) => self.ready.extend(frames),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
