use serde::{Deserialize, Serialize};

/// Token accounting for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One partial tool-call update keyed by its stream index.
///
/// Every field besides `index` is optional: a single logical call is usually
/// described across many fragments sharing the same index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub call_id: Option<String>,
    pub name: Option<String>,
    pub arguments_chunk: Option<String>,
}

/// A fully reassembled tool call. `arguments` is always a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A single unit of streamed turn output, independent of any provider.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalEvent {
    TextDelta(String),
    /// Never forwarded by the normalizer; only complete calls leave reassembly.
    ToolCallFragment(ToolCallFragment),
    ToolCallComplete(CompletedToolCall),
    /// Result of executing a tool, injected by the orchestrator.
    ToolResult {
        call_id: String,
        name: String,
        output: String,
    },
    Usage(TokenUsage),
    Metadata {
        fingerprint: Option<String>,
    },
    Done {
        finish_reason: String,
    },
    Error {
        message: String,
    },
}

impl CanonicalEvent {
    /// `Done` and `Error` end a turn segment.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, CanonicalEvent::Done { .. } | CanonicalEvent::Error { .. })
    }
}
