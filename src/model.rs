use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::Result;
use crate::types::{ChatMessage, UpstreamChunk};

/// Lazy, finite, non-restartable sequence of upstream delta chunks.
///
/// Dropping the stream must release the underlying connection.
pub type ChunkStream = BoxStream<'static, Result<UpstreamChunk>>;

/// Streaming chat-completion provider sitting behind the gateway.
#[async_trait]
pub trait ChatUpstream: Send + Sync {
    fn provider(&self) -> &str;

    /// Opens a streaming completion for `model` over `messages`.
    ///
    /// Connection and authentication failures surface here, before any chunk is produced.
    async fn stream(&self, model: &str, messages: &[ChatMessage]) -> Result<ChunkStream>;
}
