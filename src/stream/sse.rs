//! Server-Sent Events frame parser, encoder and byte-stream adapter.
//!
//! Parsing follows the field rules of the
//! [WHATWG event stream format](https://html.spec.whatwg.org/multipage/server-sent-events.html);
//! only what an OpenAI-compatible upstream actually sends is surfaced.
use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use memchr::memchr_iter;

use crate::error::BridgeError;

/// Literal end-of-stream sentinel frame.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";
pub const DONE_PAYLOAD: &str = "[DONE]";

/// One dispatched SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_PAYLOAD
    }
}

/// Incremental SSE line parser.
///
/// Feed it text chunks split at arbitrary boundaries; it yields fully
/// assembled [`SseEvent`]s once their terminating blank line arrives.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buffer: String,
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw text and append complete events into `out`.
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.line_buffer.push_str(chunk);
        let mut consumed = 0usize;
        let bytes = self.line_buffer.as_bytes();
        let mut lines = Vec::new();
        for line_end in memchr_iter(b'\n', bytes) {
            lines.push((consumed, line_end));
            consumed = line_end + 1;
        }
        for (start, end) in lines {
            let line = self.line_buffer[start..end].to_string();
            self.process_line(line.strip_suffix('\r').unwrap_or(&line), out);
        }
        self.line_buffer.drain(..consumed);
    }

    /// Feed raw text and return any complete events parsed.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Dispatch whatever is pending when the byte stream ends without a trailing blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            let mut sink = Vec::new();
            self.process_line(line.strip_suffix('\r').unwrap_or(&line), &mut sink);
        }
        self.take_event()
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if !self.has_data {
            self.event_type = None;
            return None;
        }
        self.has_data = false;
        Some(SseEvent {
            event: self.event_type.take(),
            data: std::mem::take(&mut self.data_buffer),
        })
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if let Some(event) = self.take_event() {
                out.push(event);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if self.has_data {
                    self.data_buffer.push('\n');
                } else {
                    self.has_data = true;
                }
                self.data_buffer.push_str(value);
            }
            "event" => self.event_type = Some(value.to_string()),
            // `id`, `retry` and unknown fields carry nothing the pipeline uses.
            _ => {}
        }
    }
}

/// Format an OpenAI-style SSE frame (no event type, just data).
#[must_use]
pub fn data_frame(json: &str) -> String {
    let mut out = String::with_capacity(8 + json.len());
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    out
}

struct FrameStreamState<S> {
    bytes: Pin<Box<S>>,
    parser: SseParser,
    utf8_tail: Vec<u8>,
    pending: VecDeque<SseEvent>,
    finished: bool,
}

/// Split an HTTP body byte stream into SSE events.
///
/// Unlike a lossy adapter this surfaces transport failures as `Err` items and
/// stops after the first one. Multi-byte UTF-8 sequences split across network
/// chunks are carried over to the next chunk.
pub fn sse_event_stream<S, E>(byte_stream: S) -> impl Stream<Item = Result<SseEvent, BridgeError>>
where
    S: Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let state = FrameStreamState {
        bytes: Box::pin(byte_stream),
        parser: SseParser::new(),
        utf8_tail: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.utf8_tail.extend_from_slice(&chunk);
                    let valid_up_to = match std::str::from_utf8(&state.utf8_tail) {
                        Ok(_) => state.utf8_tail.len(),
                        Err(err) if err.error_len().is_none() => err.valid_up_to(),
                        Err(err) => {
                            state.finished = true;
                            return Some((
                                Err(BridgeError::Protocol(format!(
                                    "upstream sent invalid UTF-8: {err}"
                                ))),
                                state,
                            ));
                        }
                    };
                    let rest = state.utf8_tail.split_off(valid_up_to);
                    let text = String::from_utf8_lossy(&state.utf8_tail).into_owned();
                    state.utf8_tail = rest;
                    let mut parsed = Vec::new();
                    state.parser.feed_into(&text, &mut parsed);
                    state.pending.extend(parsed);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((
                        Err(BridgeError::Transport(format!(
                            "upstream stream interrupted: {err}"
                        ))),
                        state,
                    ));
                }
                None => {
                    state.finished = true;
                    if let Some(event) = state.parser.finish() {
                        state.pending.push_back(event);
                    }
                }
            }
        }
    })
}
