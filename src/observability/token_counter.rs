use std::time::Duration;

use tracing::info;

use crate::protocol::event::TokenUsage;
use crate::protocol::openai_chat::OpenAiMessage;

/// Estimate the number of tokens in `text`.
///
/// One token per four characters, rounded down. Counts chars, not bytes, so
/// CJK text is not overcounted.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / 4) as u64
}

/// Sum of per-message estimates over the client's request messages.
#[must_use]
pub fn estimate_prompt_tokens(messages: &[OpenAiMessage]) -> u64 {
    messages
        .iter()
        .filter_map(OpenAiMessage::content_text)
        .map(|text| estimate_tokens(&text))
        .sum()
}

/// Fallback usage when the upstream never reported one.
#[must_use]
pub fn estimate_usage(prompt_tokens: u64, completion_text: &str) -> TokenUsage {
    TokenUsage::new(prompt_tokens, estimate_tokens(completion_text))
}

/// Log token usage for a completed request at INFO level.
pub fn log_request_usage(
    model: &str,
    usage: &TokenUsage,
    estimated: bool,
    duration: Duration,
    first_chunk: Option<Duration>,
) {
    info!(
        model = model,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens,
        estimated,
        duration_seconds = duration.as_secs_f64(),
        first_chunk_seconds = first_chunk.map(|d| d.as_secs_f64()),
        "request completed"
    );
}
