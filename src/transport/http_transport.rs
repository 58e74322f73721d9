use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::config::UpstreamConfig;
use crate::error::BridgeError;
use crate::protocol::openai_chat::OpenAiChatRequest;
use crate::stream::upstream_chunk_stream;

use super::{ChatUpstream, ChunkStream};

/// Upstream error bodies are truncated to this many bytes in error messages.
const ERROR_BODY_PREVIEW_BYTES: usize = 2048;
/// Reading a non-2xx body stops after this many bytes.
const ERROR_BODY_MAX_BYTES: usize = 64 * 1024;

fn build_reqwest_client(config: &UpstreamConfig) -> Result<reqwest::Client, BridgeError> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = config.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| BridgeError::Transport(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    }

    builder
        .build()
        .map_err(|err| BridgeError::Transport(format!("Failed to build HTTP client: {err}")))
}

fn chat_completions_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/chat/completions")
    }
}

fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Extract the most useful message from an upstream error body.
fn upstream_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| truncate_utf8(body, ERROR_BODY_PREVIEW_BYTES).to_string())
}

/// Read a rejected response's body within `limit`, keeping at most
/// `ERROR_BODY_MAX_BYTES`. A stalled or broken body yields what arrived so far.
async fn read_error_body(response: reqwest::Response, limit: Duration) -> String {
    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();
    let read = async {
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            let room = ERROR_BODY_MAX_BYTES - body.len();
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= ERROR_BODY_MAX_BYTES {
                break;
            }
        }
        Ok::<(), reqwest::Error>(())
    };
    let outcome = tokio::time::timeout(limit, read).await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "failed to read upstream error body"),
        Err(_) => tracing::warn!(
            read_bytes = body.len(),
            "upstream error body not complete within {}s",
            limit.as_secs()
        ),
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Streaming chat-completions client for one OpenAI-compatible upstream.
///
/// The connect attempt and response headers are bounded by
/// `connect_timeout_secs`, as is reading the body of a rejected request.
/// Once a successful body is streaming no timeout applies.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    api_key: String,
    header_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &UpstreamConfig) -> Result<Self, BridgeError> {
        Ok(Self {
            client: build_reqwest_client(config)?,
            url: chat_completions_url(&config.base_url),
            api_key: config.api_key.clone(),
            header_timeout: Duration::from_secs(config.connect_timeout_secs),
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChatUpstream for HttpTransport {
    async fn stream_chat(&self, request: &OpenAiChatRequest) -> Result<ChunkStream, BridgeError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header(http::header::ACCEPT, "text/event-stream")
            .json(request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = tokio::time::timeout(self.header_timeout, builder.send())
            .await
            .map_err(|_| {
                BridgeError::Transport(format!(
                    "upstream did not respond within {}s",
                    self.header_timeout.as_secs()
                ))
            })?
            .map_err(|err| BridgeError::Transport(format!("upstream request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = read_error_body(response, self.header_timeout).await;
            let message = upstream_error_message(&body);
            tracing::warn!(status = status.as_u16(), %message, "upstream rejected request");
            return Err(BridgeError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        tracing::debug!(model = %request.model, "upstream stream opened");
        Ok(upstream_chunk_stream(response.bytes_stream()).boxed())
    }
}
