pub mod encoder;
pub mod normalizer;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::agent::orchestrator::{TurnOrchestrator, TurnOutcome, TurnRequest};
use crate::agent::session::Session;
use crate::error::BridgeError;
use crate::observability::log_request_complete;
use crate::protocol::event::CanonicalEvent;
use crate::protocol::openai_chat::OpenAiChatResponse;

pub use encoder::{EncodeOutcome, ResponseAccumulator, WireEncoder};
pub use normalizer::{normalize, Normalizer, ReassemblyState};

/// Start the producer half of a pipeline on its own task.
///
/// The returned receiver is the only consumer; dropping it cancels the turn.
pub fn spawn_turn(
    orchestrator: TurnOrchestrator,
    session: Arc<Session>,
    turn: TurnRequest,
    buffer: usize,
) -> mpsc::Receiver<CanonicalEvent> {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let span = tracing::info_span!("turn", session = session.id(), model = %turn.model);
    tokio::spawn(
        async move {
            match orchestrator.run(session, turn, tx).await {
                TurnOutcome::Completed { rounds } => tracing::debug!(rounds, "turn completed"),
                TurnOutcome::Failed => tracing::debug!("turn failed"),
                TurnOutcome::Cancelled => tracing::info!("client went away, turn cancelled"),
            }
        }
        .instrument(span),
    );
    rx
}

struct BodyState {
    rx: mpsc::Receiver<CanonicalEvent>,
    encoder: WireEncoder,
    model: String,
    started: Instant,
    first_chunk: Option<Duration>,
    finished: bool,
}

/// Consumer half for streaming responses: canonical events in, SSE bytes out.
///
/// The role chunk is yielded before any event arrives. The stream ends after
/// `[DONE]` or after an error frame.
pub fn sse_body(
    rx: mpsc::Receiver<CanonicalEvent>,
    encoder: WireEncoder,
    model: String,
    started: Instant,
) -> impl Stream<Item = Result<bytes::Bytes, Infallible>> + Send + 'static {
    let state = BodyState {
        rx,
        encoder,
        model,
        started,
        first_chunk: None,
        finished: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        let mut out = String::new();
        if state.encoder.chunks_sent() == 0 {
            state.encoder.open(&mut out);
            return Some((Ok(bytes::Bytes::from(out)), state));
        }

        loop {
            match state.rx.recv().await {
                Some(event) => {
                    let outcome = state.encoder.encode(event, &mut out);
                    if outcome == EncodeOutcome::Closed {
                        state.finished = true;
                        return Some((Ok(bytes::Bytes::from(out)), state));
                    }
                    if !out.is_empty() {
                        state.first_chunk.get_or_insert_with(|| state.started.elapsed());
                        return Some((Ok(bytes::Bytes::from(out)), state));
                    }
                }
                None => {
                    state.finished = true;
                    if let Some((usage, estimated)) = state.encoder.finish(&mut out) {
                        log_request_complete(
                            &state.model,
                            &usage,
                            estimated,
                            state.started,
                            state.first_chunk,
                        );
                    }
                    return Some((Ok(bytes::Bytes::from(out)), state));
                }
            }
        }
    })
}

/// Consumer half for non-streaming responses.
pub async fn collect_response(
    mut rx: mpsc::Receiver<CanonicalEvent>,
    mut accumulator: ResponseAccumulator,
    model: &str,
    started: Instant,
) -> Result<OpenAiChatResponse, BridgeError> {
    while let Some(event) = rx.recv().await {
        accumulator.push(event)?;
    }
    let (usage, estimated) = accumulator.usage();
    log_request_complete(model, &usage, estimated, started, None);
    Ok(accumulator.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::event::TokenUsage;
    use futures_util::StreamExt;

    async fn body_text(events: Vec<CanonicalEvent>) -> String {
        let (tx, rx) = mpsc::channel(8);
        let encoder = WireEncoder::new("chatcmpl-t".into(), 1, "m".into(), 0);
        let producer = tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        let chunks: Vec<_> = sse_body(rx, encoder, "m".into(), Instant::now())
            .collect()
            .await;
        producer.await.unwrap();
        chunks
            .into_iter()
            .map(|chunk| String::from_utf8(chunk.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_body_frames_in_order() {
        let text = body_text(vec![
            CanonicalEvent::TextDelta("a".into()),
            CanonicalEvent::TextDelta("b".into()),
            CanonicalEvent::Done {
                finish_reason: "stop".into(),
            },
            CanonicalEvent::Usage(TokenUsage::new(2, 2)),
        ])
        .await;
        let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 5);
        assert!(frames[0].contains("\"role\":\"assistant\""));
        assert!(frames[1].contains("\"content\":\"a\""));
        assert!(frames[2].contains("\"content\":\"b\""));
        assert!(frames[3].contains("\"finish_reason\":\"stop\""));
        assert!(frames[3].contains("\"total_tokens\":4"));
        assert_eq!(frames[4], "data: [DONE]");
    }

    #[tokio::test]
    async fn test_body_error_has_no_done() {
        let text = body_text(vec![
            CanonicalEvent::TextDelta("a".into()),
            CanonicalEvent::Error {
                message: "reset".into(),
            },
            CanonicalEvent::TextDelta("late".into()),
        ])
        .await;
        assert!(text.contains("\"error\""));
        assert!(!text.contains("[DONE]"));
        assert!(!text.contains("late"));
    }

    #[tokio::test]
    async fn test_collect_response_error_maps_to_stream_error() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(CanonicalEvent::TextDelta("x".into())).await.unwrap();
        tx.send(CanonicalEvent::Error {
            message: "upstream gone".into(),
        })
        .await
        .unwrap();
        drop(tx);
        let acc = ResponseAccumulator::new("id".into(), 0, "m".into(), 0);
        let err = collect_response(rx, acc, "m", Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Stream(ref message) if message == "upstream gone"));
    }
}
