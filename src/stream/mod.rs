pub mod sse;

use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use crate::error::BridgeError;
use crate::protocol::openai_chat::OpenAiStreamChunk;

pub use sse::{data_frame, sse_event_stream, SseEvent, SseParser, DONE_FRAME};

/// Status reported for an error object the upstream sent inside a 200 stream.
const IN_STREAM_ERROR_STATUS: u16 = 502;

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<Value>,
}

fn in_stream_error_message(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| other.to_string(), str::to_string),
    }
}

/// Decode one upstream `data:` payload.
///
/// Returns `Ok(None)` for the `[DONE]` sentinel. A top-level `error` object is
/// an upstream failure, not an empty chunk.
pub fn decode_upstream_data(data: &str) -> Result<Option<OpenAiStreamChunk>, BridgeError> {
    if data.trim() == sse::DONE_PAYLOAD {
        return Ok(None);
    }
    if memchr::memmem::find(data.as_bytes(), b"\"error\"").is_some() {
        if let Ok(ErrorEnvelope { error: Some(error) }) = serde_json::from_str(data) {
            if !error.is_null() {
                return Err(BridgeError::Upstream {
                    status: IN_STREAM_ERROR_STATUS,
                    message: in_stream_error_message(&error),
                });
            }
        }
    }
    serde_json::from_str(data)
        .map(Some)
        .map_err(|err| BridgeError::Protocol(format!("malformed upstream chunk: {err}")))
}

/// Turn an upstream HTTP body into decoded stream chunks.
///
/// The sequence ends at `[DONE]`, at the first transport or decode error
/// (which is yielded), or when the body ends.
pub fn upstream_chunk_stream<S, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<OpenAiStreamChunk, BridgeError>>
where
    S: Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let events = Box::pin(sse_event_stream(byte_stream));
    futures_util::stream::unfold(Some(events), |events| async move {
        let mut events = events?;
        loop {
            match events.next().await? {
                Ok(event) => {
                    if event.data.is_empty() {
                        continue;
                    }
                    match decode_upstream_data(&event.data) {
                        Ok(Some(chunk)) => return Some((Ok(chunk), Some(events))),
                        Ok(None) => return None,
                        Err(err) => return Some((Err(err), None)),
                    }
                }
                Err(err) => return Some((Err(err), None)),
            }
        }
    })
}
