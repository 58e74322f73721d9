mod http_transport;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::BridgeError;
use crate::protocol::openai_chat::{OpenAiChatRequest, OpenAiStreamChunk};

pub use http_transport::HttpTransport;

/// Decoded upstream frames for one call. Dropping it releases the connection.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<OpenAiStreamChunk, BridgeError>> + Send>>;

/// A streaming chat-completions upstream.
#[async_trait]
pub trait ChatUpstream: Send + Sync {
    /// Open one streaming call. Errors here happen before any frame was read.
    async fn stream_chat(&self, request: &OpenAiChatRequest) -> Result<ChunkStream, BridgeError>;
}
