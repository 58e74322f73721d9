use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use crate::agent::orchestrator::TurnRequest;
use crate::agent::prompt::PromptAssembler;
use crate::agent::session::{Session, SessionStore};
use crate::error::BridgeError;
use crate::observability::token_counter::estimate_prompt_tokens;
use crate::pipeline::{collect_response, spawn_turn, sse_body, ResponseAccumulator, WireEncoder};
use crate::protocol::openai_chat::{OpenAiChatRequest, OpenAiMessage};
use crate::state::AppState;
use crate::util::{new_completion_id, random_hex, unix_now_secs};

/// `POST /v1/chat/completions`.
pub async fn handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: bytes::Bytes) -> Response {
    match handle(state, &headers, &body).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "chat completion rejected");
            err.into_response()
        }
    }
}

fn parse_request(body: &[u8]) -> Result<OpenAiChatRequest, BridgeError> {
    let request: OpenAiChatRequest = serde_json::from_slice(body)
        .map_err(|err| BridgeError::InvalidRequest(format!("malformed request body: {err}")))?;
    if request.messages.is_empty() {
        return Err(BridgeError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }
    Ok(request)
}

/// Latest non-empty user message, used to pick skills for the system prompt.
fn last_user_query(messages: &[OpenAiMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .filter(|message| message.role == "user")
        .filter_map(OpenAiMessage::content_text)
        .find(|text| !text.is_empty())
}

/// History the turn starts from: the assembled system prompt when the
/// request carries none, then every request message.
fn turn_messages(prompts: &PromptAssembler, request: &OpenAiChatRequest) -> Vec<OpenAiMessage> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !request.messages.iter().any(|message| message.role == "system") {
        let query = last_user_query(&request.messages);
        messages.push(OpenAiMessage::text("system", prompts.system_prompt(query.as_deref())));
    }
    messages.extend(request.messages.iter().cloned());
    messages
}

/// Resolve the session for this request and reset it to the request history.
///
/// Requests without `user` get an ephemeral session that is never stored. The
/// returned messages are the turn's own snapshot; a later request for the same
/// user can replace the session without affecting this turn.
fn prepare_session(
    sessions: &dyn SessionStore,
    prompts: &PromptAssembler,
    request: &OpenAiChatRequest,
) -> (Arc<Session>, Vec<OpenAiMessage>) {
    let session = match request.user.as_deref().filter(|user| !user.is_empty()) {
        Some(user) => sessions.get_or_create(user),
        None => Arc::new(Session::new(format!("openai-compat-{}", random_hex(8)))),
    };
    let messages = turn_messages(prompts, request);
    session.replace(messages.clone());
    (session, messages)
}

async fn handle(state: Arc<AppState>, headers: &HeaderMap, body: &[u8]) -> Result<Response, BridgeError> {
    state.auth.authenticate(headers)?;
    let request = parse_request(body)?;

    let started = Instant::now();
    let completion_id = new_completion_id();
    let created = unix_now_secs();
    let client_model = request.model.clone();
    let upstream_model = state.config.map_model_name(&request.model).to_string();
    let streaming = request.stream.unwrap_or(false);

    let (session, messages) = prepare_session(state.sessions.as_ref(), &state.prompts, &request);
    let prompt_tokens = estimate_prompt_tokens(&request.messages);
    tracing::info!(
        id = %completion_id,
        session = session.id(),
        model = %client_model,
        upstream_model = %upstream_model,
        stream = streaming,
        messages = request.messages.len(),
        "chat completion"
    );

    let turn = TurnRequest {
        messages,
        model: upstream_model,
        max_tokens: request
            .max_tokens
            .unwrap_or(state.config.agent.default_max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        presence_penalty: request.presence_penalty,
        frequency_penalty: request.frequency_penalty,
    };
    let rx = spawn_turn(
        state.orchestrator(),
        session,
        turn,
        state.config.server.stream_buffer,
    );

    if streaming {
        let encoder = WireEncoder::new(completion_id, created, client_model.clone(), prompt_tokens);
        let body = Body::from_stream(sse_body(rx, encoder, client_model, started));
        return Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
                (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            ],
            body,
        )
            .into_response());
    }

    let accumulator =
        ResponseAccumulator::new(completion_id, created, client_model.clone(), prompt_tokens);
    let response = collect_response(rx, accumulator, &client_model, started).await?;
    Ok(Json(response).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::session::InMemorySessionStore;
    use crate::agent::skills::SkillCatalog;

    #[test]
    fn test_parse_rejects_empty_messages() {
        let err = parse_request(br#"{"model":"m","messages":[]}"#).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
        assert!(parse_request(b"not json").is_err());
    }

    fn request(user: Option<&str>, text: &str) -> OpenAiChatRequest {
        serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": text}],
            "user": user,
        }))
        .unwrap()
    }

    fn prompts() -> PromptAssembler {
        PromptAssembler::new("does-not-exist", Arc::new(SkillCatalog::default()))
    }

    #[test]
    fn test_same_user_requests_keep_separate_snapshots() {
        let sessions = InMemorySessionStore::new();
        let prompts = prompts();

        let (session_a, messages_a) =
            prepare_session(&sessions, &prompts, &request(Some("alice"), "request A"));
        let (session_b, messages_b) =
            prepare_session(&sessions, &prompts, &request(Some("alice"), "request B"));

        assert!(Arc::ptr_eq(&session_a, &session_b));
        assert_eq!(messages_a[0].role, "system");
        assert_eq!(messages_a[1].content_text().as_deref(), Some("request A"));
        assert_eq!(messages_b[1].content_text().as_deref(), Some("request B"));
        assert_eq!(session_a.messages(), messages_b);
    }

    #[test]
    fn test_anonymous_request_is_not_stored() {
        let sessions = InMemorySessionStore::new();
        let (session, messages) = prepare_session(&sessions, &prompts(), &request(None, "hi"));
        assert!(session.id().starts_with("openai-compat-"));
        assert_eq!(session.len(), messages.len());
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_existing_system_message_is_kept() {
        let mut req = request(None, "hi");
        req.messages.insert(0, OpenAiMessage::text("system", "custom"));
        let messages = turn_messages(&prompts(), &req);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content_text().as_deref(), Some("custom"));
    }

    #[test]
    fn test_last_user_query_skips_empty() {
        let messages = vec![
            OpenAiMessage::text("user", "first"),
            OpenAiMessage::text("assistant", "reply"),
            OpenAiMessage::text("user", ""),
        ];
        assert_eq!(last_user_query(&messages).as_deref(), Some("first"));
    }
}
