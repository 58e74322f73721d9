use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use super::session::Session;
use super::tools::ToolRegistry;
use crate::pipeline::normalizer::normalize;
use crate::protocol::event::{CanonicalEvent, CompletedToolCall};
use crate::protocol::openai_chat::{
    OpenAiChatRequest, OpenAiMessage, OpenAiStreamOptions, OpenAiTool, OpenAiToolCall,
    OpenAiToolCallFunction,
};
use crate::transport::ChatUpstream;

/// Per-turn parameters forwarded to every upstream round.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    /// History the first round is sent with, fixed when the request was accepted.
    pub messages: Vec<OpenAiMessage>,
    pub model: String,
    pub max_tokens: u64,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { rounds: u32 },
    Failed,
    /// The event receiver went away before the turn finished.
    Cancelled,
}

enum RoundEnd {
    Finished {
        text: String,
        calls: Vec<CompletedToolCall>,
    },
    Failed,
    Cancelled,
}

/// Runs one agent turn: upstream rounds interleaved with tool execution.
#[derive(Clone)]
pub struct TurnOrchestrator {
    upstream: Arc<dyn ChatUpstream>,
    tools: Arc<ToolRegistry>,
    max_tool_rounds: u32,
}

impl TurnOrchestrator {
    #[must_use]
    pub fn new(upstream: Arc<dyn ChatUpstream>, tools: Arc<ToolRegistry>, max_tool_rounds: u32) -> Self {
        Self {
            upstream,
            tools,
            max_tool_rounds: max_tool_rounds.max(1),
        }
    }

    /// Drive the turn, sending every canonical event into `tx`.
    ///
    /// Returns as soon as `tx` is closed; the in-flight upstream stream is
    /// dropped at that point.
    pub async fn run(
        &self,
        session: Arc<Session>,
        turn: TurnRequest,
        tx: mpsc::Sender<CanonicalEvent>,
    ) -> TurnOutcome {
        let schemas = self.tools.schemas();
        let mut messages = turn.messages.clone();
        let mut full_text = String::new();
        let mut rounds = 0u32;

        let outcome = loop {
            rounds += 1;
            let request = build_round_request(&turn, &messages, &schemas);
            let (text, calls) = match self.run_round(&request, &tx).await {
                RoundEnd::Finished { text, calls } => (text, calls),
                RoundEnd::Failed => break TurnOutcome::Failed,
                RoundEnd::Cancelled => break TurnOutcome::Cancelled,
            };
            full_text.push_str(&text);

            if calls.is_empty() {
                break TurnOutcome::Completed { rounds };
            }
            if rounds >= self.max_tool_rounds {
                tracing::warn!(
                    rounds,
                    pending = calls.len(),
                    "tool round limit reached, returning tool calls to the client"
                );
                break TurnOutcome::Completed { rounds };
            }

            let assistant = assistant_tool_message(&text, &calls);
            session.add_message(assistant.clone());
            messages.push(assistant);

            for call in calls {
                let output = tokio::select! {
                    biased;
                    () = tx.closed() => return TurnOutcome::Cancelled,
                    output = self.tools.execute(&call.name, &call.arguments) => output.into_text(),
                };
                let tool_message = OpenAiMessage {
                    role: "tool".to_string(),
                    content: Some(Value::String(output.clone())),
                    name: Some(call.name.clone()),
                    tool_calls: None,
                    tool_call_id: Some(call.call_id.clone()),
                };
                session.add_message(tool_message.clone());
                messages.push(tool_message);

                let event = CanonicalEvent::ToolResult {
                    call_id: call.call_id,
                    name: call.name,
                    output,
                };
                if tx.send(event).await.is_err() {
                    return TurnOutcome::Cancelled;
                }
            }
        };

        if !full_text.is_empty() && outcome != TurnOutcome::Cancelled {
            session.add_assistant_message(full_text);
        }
        outcome
    }

    async fn run_round(
        &self,
        request: &OpenAiChatRequest,
        tx: &mpsc::Sender<CanonicalEvent>,
    ) -> RoundEnd {
        let opened = tokio::select! {
            biased;
            () = tx.closed() => return RoundEnd::Cancelled,
            opened = self.upstream.stream_chat(request) => opened,
        };
        let chunks = match opened {
            Ok(chunks) => chunks,
            Err(err) => {
                tracing::error!(error = %err, "failed to open upstream stream");
                let _ = tx
                    .send(CanonicalEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
                return RoundEnd::Failed;
            }
        };

        let mut events = Box::pin(normalize(chunks));
        let mut text = String::new();
        let mut calls = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                () = tx.closed() => return RoundEnd::Cancelled,
                next = events.next() => next,
            };
            let Some(event) = next else {
                break;
            };
            let failed = matches!(event, CanonicalEvent::Error { .. });
            match &event {
                CanonicalEvent::TextDelta(delta) => text.push_str(delta),
                CanonicalEvent::ToolCallComplete(call) => calls.push(call.clone()),
                CanonicalEvent::Error { message } => {
                    tracing::error!(%message, "upstream stream failed");
                }
                _ => {}
            }
            if tx.send(event).await.is_err() {
                return RoundEnd::Cancelled;
            }
            if failed {
                return RoundEnd::Failed;
            }
        }
        RoundEnd::Finished { text, calls }
    }
}

fn build_round_request(
    turn: &TurnRequest,
    messages: &[OpenAiMessage],
    schemas: &[OpenAiTool],
) -> OpenAiChatRequest {
    OpenAiChatRequest {
        model: turn.model.clone(),
        messages: messages.to_vec(),
        tools: (!schemas.is_empty()).then(|| schemas.to_vec()),
        stream: Some(true),
        stream_options: Some(OpenAiStreamOptions {
            include_usage: Some(true),
        }),
        temperature: turn.temperature,
        top_p: turn.top_p,
        max_tokens: Some(turn.max_tokens),
        presence_penalty: turn.presence_penalty,
        frequency_penalty: turn.frequency_penalty,
        n: None,
        user: None,
    }
}

fn assistant_tool_message(text: &str, calls: &[CompletedToolCall]) -> OpenAiMessage {
    OpenAiMessage {
        role: "assistant".to_string(),
        content: (!text.is_empty()).then(|| Value::String(text.to_string())),
        name: None,
        tool_calls: Some(
            calls
                .iter()
                .map(|call| OpenAiToolCall {
                    id: call.call_id.clone(),
                    type_: "function".to_string(),
                    function: OpenAiToolCallFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect(),
        ),
        tool_call_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::{Tool, ToolOutput};
    use crate::error::BridgeError;
    use crate::protocol::openai_chat::OpenAiStreamChunk;
    use crate::transport::ChunkStream;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Replays one scripted frame list per upstream call and records requests.
    struct ScriptedUpstream {
        rounds: Mutex<VecDeque<Vec<Result<OpenAiStreamChunk, BridgeError>>>>,
        requests: Mutex<Vec<OpenAiChatRequest>>,
    }

    impl ScriptedUpstream {
        fn new(rounds: Vec<Vec<Value>>) -> Arc<Self> {
            let rounds = rounds
                .into_iter()
                .map(|frames| {
                    frames
                        .into_iter()
                        .map(|frame| Ok(serde_json::from_value(frame).unwrap()))
                        .collect()
                })
                .collect();
            Arc::new(Self {
                rounds: Mutex::new(rounds),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatUpstream for ScriptedUpstream {
        async fn stream_chat(&self, request: &OpenAiChatRequest) -> Result<ChunkStream, BridgeError> {
            self.requests.lock().push(request.clone());
            let frames = self
                .rounds
                .lock()
                .pop_front()
                .ok_or_else(|| BridgeError::Upstream {
                    status: 503,
                    message: "no scripted round left".into(),
                })?;
            Ok(futures_util::stream::iter(frames).boxed())
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the text argument"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, arguments: &Value) -> ToolOutput {
            ToolOutput::ok(arguments["text"].as_str().unwrap_or_default().to_string())
        }
    }

    fn tool_call_round(name: &str) -> Vec<Value> {
        vec![
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "type": "function",
                 "function": {"name": name, "arguments": "{\"text\":\"pong\"}"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        ]
    }

    fn text_round(text: &str) -> Vec<Value> {
        vec![
            json!({"choices": [{"index": 0, "delta": {"content": text}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}}),
        ]
    }

    fn orchestrator(upstream: Arc<ScriptedUpstream>, max_rounds: u32) -> TurnOrchestrator {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        TurnOrchestrator::new(upstream, Arc::new(registry), max_rounds)
    }

    async fn collect(mut rx: mpsc::Receiver<CanonicalEvent>) -> Vec<CanonicalEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn turn() -> TurnRequest {
        TurnRequest {
            messages: vec![OpenAiMessage::text("user", "ping")],
            model: "qwen-plus".into(),
            max_tokens: 4096,
            ..TurnRequest::default()
        }
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let upstream = ScriptedUpstream::new(vec![tool_call_round("echo"), text_round("done")]);
        let session = Arc::new(Session::new("s"));
        session.replace(turn().messages);
        let (tx, rx) = mpsc::channel(16);
        let outcome = orchestrator(Arc::clone(&upstream), 5)
            .run(Arc::clone(&session), turn(), tx)
            .await;
        assert_eq!(outcome, TurnOutcome::Completed { rounds: 2 });

        let events = collect(rx).await;
        assert!(matches!(&events[0], CanonicalEvent::ToolCallComplete(call) if call.name == "echo"));
        assert!(events.contains(&CanonicalEvent::ToolResult {
            call_id: "call_1".into(),
            name: "echo".into(),
            output: "pong".into(),
        }));
        assert!(events.contains(&CanonicalEvent::TextDelta("done".into())));

        let requests = upstream.requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].stream_options.as_ref().unwrap().include_usage, Some(true));
        assert_eq!(requests[0].tools.as_ref().unwrap()[0].function.name, "echo");
        let second = &requests[1].messages;
        assert_eq!(second[1].role, "assistant");
        assert_eq!(second[2].role, "tool");
        assert_eq!(second[2].tool_call_id.as_deref(), Some("call_1"));

        let history = session.messages();
        assert_eq!(history.last().unwrap().content_text().as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_unknown_tool_output_is_error_text() {
        let upstream = ScriptedUpstream::new(vec![tool_call_round("missing"), text_round("ok")]);
        let (tx, rx) = mpsc::channel(16);
        orchestrator(upstream, 5)
            .run(Arc::new(Session::new("s")), turn(), tx)
            .await;
        let events = collect(rx).await;
        let output = events.iter().find_map(|event| match event {
            CanonicalEvent::ToolResult { name, output, .. } => Some((name.clone(), output.clone())),
            _ => None,
        });
        let (name, output) = output.unwrap();
        assert_eq!(name, "missing");
        assert!(output.starts_with("Error: "));
    }

    #[tokio::test]
    async fn test_round_limit_stops_tool_loop() {
        let upstream = ScriptedUpstream::new(vec![tool_call_round("echo"), tool_call_round("echo")]);
        let (tx, rx) = mpsc::channel(16);
        let outcome = orchestrator(Arc::clone(&upstream), 1)
            .run(Arc::new(Session::new("s")), turn(), tx)
            .await;
        assert_eq!(outcome, TurnOutcome::Completed { rounds: 1 });
        assert_eq!(upstream.requests.lock().len(), 1);
        let events = collect(rx).await;
        assert!(!events.iter().any(|e| matches!(e, CanonicalEvent::ToolResult { .. })));
    }

    #[tokio::test]
    async fn test_open_failure_is_single_error_event() {
        let upstream = ScriptedUpstream::new(vec![]);
        let (tx, rx) = mpsc::channel(16);
        let outcome = orchestrator(upstream, 5)
            .run(Arc::new(Session::new("s")), turn(), tx)
            .await;
        assert_eq!(outcome, TurnOutcome::Failed);
        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], CanonicalEvent::Error { message } if message.contains("503")));
    }

    #[tokio::test]
    async fn test_closed_receiver_cancels() {
        let upstream = ScriptedUpstream::new(vec![text_round("never read")]);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let outcome = orchestrator(Arc::clone(&upstream), 5)
            .run(Arc::new(Session::new("s")), turn(), tx)
            .await;
        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert!(upstream.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_turn_uses_its_own_snapshot_not_the_shared_session() {
        let upstream = ScriptedUpstream::new(vec![text_round("for a")]);
        let session = Arc::new(Session::new("alice"));
        let request_a = vec![OpenAiMessage::text("user", "request A")];
        session.replace(request_a.clone());
        // A second request for the same user resets the history before A runs.
        session.replace(vec![
            OpenAiMessage::text("system", "s"),
            OpenAiMessage::text("user", "request B"),
        ]);

        let (tx, _rx) = mpsc::channel(16);
        let turn_a = TurnRequest {
            messages: request_a.clone(),
            ..turn()
        };
        orchestrator(Arc::clone(&upstream), 5)
            .run(session, turn_a, tx)
            .await;

        let requests = upstream.requests.lock();
        assert_eq!(requests[0].messages, request_a);
    }

    /// Sets the flag when dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Yields one text frame, then never yields again.
    struct StalledUpstream {
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ChatUpstream for StalledUpstream {
        async fn stream_chat(&self, _request: &OpenAiChatRequest) -> Result<ChunkStream, BridgeError> {
            let first: OpenAiStreamChunk = serde_json::from_value(
                json!({"choices": [{"index": 0, "delta": {"content": "partial"}}]}),
            )
            .unwrap();
            let guard = DropFlag(Arc::clone(&self.dropped));
            let frames = futures_util::stream::iter(vec![Ok(first)])
                .chain(futures_util::stream::pending())
                .map(move |frame| {
                    let _alive = &guard;
                    frame
                });
            Ok(frames.boxed())
        }
    }

    #[tokio::test]
    async fn test_client_disconnect_mid_stream_releases_upstream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let upstream = Arc::new(StalledUpstream {
            dropped: Arc::clone(&dropped),
        });
        let orchestrator = TurnOrchestrator::new(upstream, Arc::new(ToolRegistry::new()), 5);
        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(async move {
            orchestrator.run(Arc::new(Session::new("s")), turn(), tx).await
        });

        assert_eq!(rx.recv().await, Some(CanonicalEvent::TextDelta("partial".into())));
        assert!(!dropped.load(Ordering::SeqCst));
        drop(rx);

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("turn stops after the client leaves")
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert!(dropped.load(Ordering::SeqCst));
    }

    /// Never finishes; reports when it starts and when it is dropped.
    struct HangingTool {
        started: Arc<Notify>,
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Tool for HangingTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Never returns"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _arguments: &Value) -> ToolOutput {
            let _guard = DropFlag(Arc::clone(&self.dropped));
            self.started.notify_one();
            futures_util::future::pending::<ToolOutput>().await
        }
    }

    #[tokio::test]
    async fn test_client_disconnect_abandons_running_tool() {
        let started = Arc::new(Notify::new());
        let dropped = Arc::new(AtomicBool::new(false));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(HangingTool {
            started: Arc::clone(&started),
            dropped: Arc::clone(&dropped),
        }));
        let upstream = ScriptedUpstream::new(vec![tool_call_round("echo")]);
        let orchestrator = TurnOrchestrator::new(upstream, Arc::new(registry), 5);
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(async move {
            orchestrator.run(Arc::new(Session::new("s")), turn(), tx).await
        });

        started.notified().await;
        drop(rx);

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("turn stops while the tool is still running")
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
