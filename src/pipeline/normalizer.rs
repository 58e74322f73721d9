use std::collections::{BTreeMap, VecDeque};

use futures_util::{Stream, StreamExt};
use serde_json::{Map, Value};

use crate::error::BridgeError;
use crate::protocol::event::{CanonicalEvent, CompletedToolCall, ToolCallFragment};
use crate::protocol::openai_chat::{OpenAiStreamChunk, OpenAiStreamToolCall};
use crate::util::synthesized_call_id;

pub const UNFINISHED_TOOL_CALLS: &str = "upstream stream ended with unfinished tool calls";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ToolCallAccumulator {
    call_id: Option<String>,
    name: String,
    arguments: String,
}

/// Partial tool calls of one upstream call, keyed by fragment index.
#[derive(Debug, Default)]
pub struct ReassemblyState {
    calls: BTreeMap<u32, ToolCallAccumulator>,
}

impl ReassemblyState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Merge one fragment: the id sticks once set, the name is
    /// last-non-empty-wins, arguments only ever grow.
    pub fn apply(&mut self, fragment: ToolCallFragment) {
        let entry = self.calls.entry(fragment.index).or_default();
        if entry.call_id.is_none() {
            entry.call_id = fragment.call_id.filter(|id| !id.is_empty());
        }
        if let Some(name) = fragment.name.filter(|name| !name.is_empty()) {
            entry.name = name;
        }
        if let Some(chunk) = fragment.arguments_chunk {
            entry.arguments.push_str(&chunk);
        }
    }

    /// Drain every accumulator in ascending index order.
    pub fn flush(&mut self) -> Vec<CompletedToolCall> {
        std::mem::take(&mut self.calls)
            .into_iter()
            .map(|(index, acc)| {
                let call_id = acc.call_id.unwrap_or_else(|| synthesized_call_id(index));
                let arguments = parse_arguments(&call_id, &acc.name, &acc.arguments);
                CompletedToolCall {
                    call_id,
                    name: acc.name,
                    arguments,
                }
            })
            .collect()
    }
}

fn parse_arguments(call_id: &str, name: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            tracing::warn!(
                call_id,
                tool = name,
                kind = json_kind(&other),
                "tool call arguments are not a JSON object, using {{}}"
            );
            Value::Object(Map::new())
        }
        Err(err) => {
            tracing::warn!(
                call_id,
                tool = name,
                error = %err,
                raw_len = raw.len(),
                "malformed tool call arguments, using {{}}"
            );
            Value::Object(Map::new())
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn fragment_from_delta(delta: &OpenAiStreamToolCall) -> ToolCallFragment {
    let function = delta.function.as_ref();
    ToolCallFragment {
        index: delta.index,
        call_id: delta.id.clone(),
        name: function.and_then(|f| f.name.clone()),
        arguments_chunk: function.and_then(|f| f.arguments.clone()),
    }
}

/// Turns decoded upstream frames into canonical events for one upstream call.
#[derive(Debug, Default)]
pub struct Normalizer {
    reassembly: ReassemblyState,
    last_fingerprint: Option<String>,
    finished: bool,
}

impl Normalizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a finish reason has already been turned into `Done`.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn pending_tool_calls(&self) -> usize {
        self.reassembly.len()
    }

    /// Process one frame, appending events in the order text, completed
    /// calls, metadata, usage, done.
    pub fn push_chunk(&mut self, chunk: OpenAiStreamChunk, out: &mut Vec<CanonicalEvent>) {
        let mut finish_reason = None;

        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(text) = choice.delta.content.filter(|text| !text.is_empty()) {
                out.push(CanonicalEvent::TextDelta(text));
            }
            if let Some(tool_calls) = choice.delta.tool_calls.as_deref() {
                for delta in tool_calls {
                    self.reassembly.apply(fragment_from_delta(delta));
                }
            }
            finish_reason = choice.finish_reason.filter(|reason| !reason.is_empty());
        }

        if finish_reason.is_some() {
            for call in self.reassembly.flush() {
                out.push(CanonicalEvent::ToolCallComplete(call));
            }
        }

        if let Some(fingerprint) = chunk.system_fingerprint {
            if self.last_fingerprint.as_deref() != Some(fingerprint.as_str()) {
                self.last_fingerprint = Some(fingerprint.clone());
                out.push(CanonicalEvent::Metadata {
                    fingerprint: Some(fingerprint),
                });
            }
        }

        if let Some(usage) = chunk.usage {
            out.push(CanonicalEvent::Usage(usage.into()));
        }

        if let Some(finish_reason) = finish_reason {
            self.finished = true;
            out.push(CanonicalEvent::Done { finish_reason });
        }
    }

    /// The single terminal event for a transport or decode failure.
    pub fn fail(&mut self, err: &BridgeError) -> CanonicalEvent {
        self.finished = true;
        self.reassembly = ReassemblyState::new();
        CanonicalEvent::Error {
            message: err.to_string(),
        }
    }

    /// Close out a cleanly ended input. `None` when a finish reason was already seen.
    pub fn finish_input(&mut self) -> Option<CanonicalEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        if self.reassembly.is_empty() {
            Some(CanonicalEvent::Done {
                finish_reason: "stop".to_string(),
            })
        } else {
            tracing::warn!(
                pending = self.reassembly.len(),
                "upstream ended before a finish reason"
            );
            self.reassembly = ReassemblyState::new();
            Some(CanonicalEvent::Error {
                message: UNFINISHED_TOOL_CALLS.to_string(),
            })
        }
    }
}

struct NormalizeState<S> {
    chunks: S,
    normalizer: Normalizer,
    pending: VecDeque<CanonicalEvent>,
    ended: bool,
}

/// Adapt a decoded chunk stream into a canonical event stream.
///
/// An `Err` item produces one `Error` event and ends the sequence.
pub fn normalize<S>(chunks: S) -> impl Stream<Item = CanonicalEvent>
where
    S: Stream<Item = Result<OpenAiStreamChunk, BridgeError>> + Unpin,
{
    let state = NormalizeState {
        chunks,
        normalizer: Normalizer::new(),
        pending: VecDeque::new(),
        ended: false,
    };
    futures_util::stream::unfold(state, |mut state| async move {
        let mut scratch = Vec::new();
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.ended {
                return None;
            }
            match state.chunks.next().await {
                Some(Ok(chunk)) => {
                    state.normalizer.push_chunk(chunk, &mut scratch);
                    state.pending.extend(scratch.drain(..));
                }
                Some(Err(err)) => {
                    state.ended = true;
                    let event = state.normalizer.fail(&err);
                    state.pending.push_back(event);
                }
                None => {
                    state.ended = true;
                    if let Some(event) = state.normalizer.finish_input() {
                        state.pending.push_back(event);
                    }
                }
            }
        }
    })
}
