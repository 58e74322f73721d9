use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::{openai_error_payload, BridgeError, ErrorCategory};
use crate::observability::token_counter::estimate_usage;
use crate::protocol::event::{CanonicalEvent, CompletedToolCall, TokenUsage};
use crate::protocol::openai_chat::{
    OpenAiChatResponse, OpenAiChoice, OpenAiDelta, OpenAiMessage, OpenAiStreamChoice,
    OpenAiStreamChunk, OpenAiStreamToolCall, OpenAiStreamToolCallFunction, OpenAiToolCall,
    OpenAiToolCallFunction, CHUNK_OBJECT, COMPLETION_OBJECT,
};
use crate::stream::sse::{data_frame, DONE_FRAME};

const DEFAULT_FINISH_REASON: &str = "stop";

/// Usage, fingerprint and finish reason observed over one turn, plus the text
/// the completion estimate is computed from.
#[derive(Debug, Default)]
pub struct TurnCapture {
    usage: Option<TokenUsage>,
    fingerprint: Option<String>,
    finish_reason: Option<String>,
    completion_text: String,
}

impl TurnCapture {
    fn observe(&mut self, event: &CanonicalEvent) {
        match event {
            CanonicalEvent::TextDelta(text) => self.completion_text.push_str(text),
            CanonicalEvent::ToolCallComplete(call) => {
                self.completion_text.push_str(&arguments_string(&call.arguments));
            }
            CanonicalEvent::Usage(usage) => self.usage = Some(*usage),
            CanonicalEvent::Metadata {
                fingerprint: Some(fingerprint),
            } => self.fingerprint = Some(fingerprint.clone()),
            CanonicalEvent::Done { finish_reason } => {
                self.finish_reason = Some(finish_reason.clone());
            }
            _ => {}
        }
    }

    /// Last reported usage, or the character estimate. The flag is `true` when estimated.
    #[must_use]
    pub fn resolved_usage(&self, prompt_tokens: u64) -> (TokenUsage, bool) {
        match self.usage {
            Some(usage) => (usage, false),
            None => (estimate_usage(prompt_tokens, &self.completion_text), true),
        }
    }

    #[must_use]
    pub fn finish_reason(&self) -> &str {
        self.finish_reason.as_deref().unwrap_or(DEFAULT_FINISH_REASON)
    }

    #[must_use]
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }
}

fn arguments_string(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// Whether the encoder accepts more events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    Continue,
    Closed,
}

/// Streaming wire encoder for one response.
///
/// Frames are appended to a caller-provided buffer so the body stream can
/// batch whatever is ready into one write.
#[derive(Debug)]
pub struct WireEncoder {
    id: String,
    created: u64,
    model: String,
    prompt_tokens: u64,
    role_sent: bool,
    closed: bool,
    chunks_sent: u64,
    next_tool_index: u32,
    tool_indices: FxHashMap<String, u32>,
    capture: TurnCapture,
}

impl WireEncoder {
    #[must_use]
    pub fn new(id: String, created: u64, model: String, prompt_tokens: u64) -> Self {
        Self {
            id,
            created,
            model,
            prompt_tokens,
            role_sent: false,
            closed: false,
            chunks_sent: 0,
            next_tool_index: 0,
            tool_indices: FxHashMap::default(),
            capture: TurnCapture::default(),
        }
    }

    #[must_use]
    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub fn capture(&self) -> &TurnCapture {
        &self.capture
    }

    /// Emit the role-only opening chunk once.
    pub fn open(&mut self, out: &mut String) {
        if self.role_sent || self.closed {
            return;
        }
        self.role_sent = true;
        let delta = OpenAiDelta {
            role: Some("assistant".to_string()),
            content: Some(String::new()),
            tool_calls: None,
        };
        self.push_chunk(delta, None, None, out);
    }

    pub fn encode(&mut self, event: CanonicalEvent, out: &mut String) -> EncodeOutcome {
        if self.closed {
            return EncodeOutcome::Closed;
        }
        self.open(out);
        self.capture.observe(&event);
        match event {
            CanonicalEvent::TextDelta(text) => {
                let delta = OpenAiDelta {
                    content: Some(text),
                    ..OpenAiDelta::default()
                };
                self.push_chunk(delta, None, None, out);
            }
            CanonicalEvent::ToolCallComplete(call) => {
                let index = self.next_tool_index;
                self.next_tool_index += 1;
                self.tool_indices.insert(call.call_id.clone(), index);
                let function = OpenAiStreamToolCallFunction {
                    name: Some(call.name),
                    arguments: Some(arguments_string(&call.arguments)),
                    output: None,
                };
                self.push_tool_chunk(index, call.call_id, function, out);
            }
            CanonicalEvent::ToolResult {
                call_id,
                name,
                output,
            } => {
                let index = match self.tool_indices.get(&call_id) {
                    Some(index) => *index,
                    None => {
                        let index = self.next_tool_index;
                        self.next_tool_index += 1;
                        index
                    }
                };
                let function = OpenAiStreamToolCallFunction {
                    name: Some(name),
                    arguments: None,
                    output: Some(output),
                };
                self.push_tool_chunk(index, call_id, function, out);
            }
            CanonicalEvent::Error { message } => {
                self.push_error(&message, out);
                return EncodeOutcome::Closed;
            }
            CanonicalEvent::ToolCallFragment(_)
            | CanonicalEvent::Usage(_)
            | CanonicalEvent::Metadata { .. }
            | CanonicalEvent::Done { .. } => {}
        }
        EncodeOutcome::Continue
    }

    /// Emit the terminal chunk carrying finish reason and usage, then `[DONE]`.
    ///
    /// Returns the usage sent and whether it was estimated.
    pub fn finish(&mut self, out: &mut String) -> Option<(TokenUsage, bool)> {
        if self.closed {
            return None;
        }
        self.open(out);
        let (usage, estimated) = self.capture.resolved_usage(self.prompt_tokens);
        let finish_reason = self.capture.finish_reason().to_string();
        self.push_chunk(
            OpenAiDelta::default(),
            Some(finish_reason),
            Some(usage),
            out,
        );
        out.push_str(DONE_FRAME);
        self.closed = true;
        Some((usage, estimated))
    }

    /// Best-effort error frame. No `[DONE]` follows it.
    pub fn push_error(&mut self, message: &str, out: &mut String) {
        if self.closed {
            return;
        }
        self.closed = true;
        let payload = openai_error_payload(ErrorCategory::ServerError, message);
        out.push_str(&data_frame(&payload.to_string()));
    }

    fn push_tool_chunk(
        &mut self,
        index: u32,
        call_id: String,
        function: OpenAiStreamToolCallFunction,
        out: &mut String,
    ) {
        let delta = OpenAiDelta {
            tool_calls: Some(vec![OpenAiStreamToolCall {
                index,
                id: Some(call_id),
                type_: Some("function".to_string()),
                function: Some(function),
            }]),
            ..OpenAiDelta::default()
        };
        self.push_chunk(delta, None, None, out);
    }

    fn push_chunk(
        &mut self,
        delta: OpenAiDelta,
        finish_reason: Option<String>,
        usage: Option<TokenUsage>,
        out: &mut String,
    ) {
        let chunk = OpenAiStreamChunk {
            id: self.id.clone(),
            object: CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![OpenAiStreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: usage.map(Into::into),
            system_fingerprint: self.capture.fingerprint.clone(),
        };
        match serde_json::to_string(&chunk) {
            Ok(json) => {
                out.push_str(&data_frame(&json));
                self.chunks_sent += 1;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize stream chunk");
            }
        }
    }
}

/// Non-streaming counterpart of [`WireEncoder`]: folds events into one document.
#[derive(Debug)]
pub struct ResponseAccumulator {
    id: String,
    created: u64,
    model: String,
    prompt_tokens: u64,
    text: String,
    tool_calls: Vec<OpenAiToolCall>,
    capture: TurnCapture,
}

impl ResponseAccumulator {
    #[must_use]
    pub fn new(id: String, created: u64, model: String, prompt_tokens: u64) -> Self {
        Self {
            id,
            created,
            model,
            prompt_tokens,
            text: String::new(),
            tool_calls: Vec::new(),
            capture: TurnCapture::default(),
        }
    }

    /// Fold one event. An `Error` event aborts the response.
    pub fn push(&mut self, event: CanonicalEvent) -> Result<(), BridgeError> {
        self.capture.observe(&event);
        match event {
            CanonicalEvent::TextDelta(text) => self.text.push_str(&text),
            CanonicalEvent::ToolCallComplete(call) => self.tool_calls.push(tool_call(call)),
            CanonicalEvent::Error { message } => return Err(BridgeError::Stream(message)),
            _ => {}
        }
        Ok(())
    }

    #[must_use]
    pub fn capture(&self) -> &TurnCapture {
        &self.capture
    }

    /// Usage the document will carry and whether it is estimated.
    #[must_use]
    pub fn usage(&self) -> (TokenUsage, bool) {
        self.capture.resolved_usage(self.prompt_tokens)
    }

    #[must_use]
    pub fn finish(self) -> OpenAiChatResponse {
        let (usage, _) = self.usage();
        let message = OpenAiMessage {
            role: "assistant".to_string(),
            content: Some(Value::String(self.text)),
            name: None,
            tool_calls: (!self.tool_calls.is_empty()).then_some(self.tool_calls),
            tool_call_id: None,
        };
        OpenAiChatResponse {
            id: self.id,
            object: COMPLETION_OBJECT.to_string(),
            created: self.created,
            model: self.model,
            choices: vec![OpenAiChoice {
                index: 0,
                message,
                finish_reason: Some(self.capture.finish_reason().to_string()),
            }],
            usage: Some(usage.into()),
            system_fingerprint: self.capture.fingerprint,
        }
    }
}

fn tool_call(call: CompletedToolCall) -> OpenAiToolCall {
    OpenAiToolCall {
        id: call.call_id,
        type_: "function".to_string(),
        function: OpenAiToolCallFunction {
            name: call.name,
            arguments: arguments_string(&call.arguments),
        },
    }
}
