//! Per-request relay between one upstream completion stream and one client.
//!
//! The relay owns the upstream stream for the lifetime of a turn: it charges each
//! content-bearing chunk against the key's token budget, cuts the turn short with
//! `finish_reason: "length"` when the budget runs out, and records the finished turn in the
//! tamper log so the client may quote it back later.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::RoundtableError;
use crate::model::{ChatUpstream, ChunkStream};
use crate::types::{ChatMessage, FinishReason, UpstreamChunk, serialize_conversation};

use super::GatewayError;
use super::http::OpenAiErrorResponse;
use super::limits::KeyLimiter;
use super::observability::Observability;
use super::personas::Persona;
use super::tamper_log::TamperStore;

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";
const USAGE_LOG_INTERVAL: u64 = 100;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayPhase {
    Idle,
    Prefacing,
    Draining,
    Finalizing,
    Closed,
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    /// `text/event-stream`, one frame per upstream chunk.
    Streaming,
    /// One JSON body once the turn is complete.
    Batched,
}

impl TransportMode {
    pub fn from_stream_flag(stream: bool) -> Self {
        if stream {
            Self::Streaming
        } else {
            Self::Batched
        }
    }
}

/// Completed assistant turn, returned to clients that did not ask for streaming.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchedCompletion {
    pub content: String,
    pub finish_reason: FinishReason,
}

impl BatchedCompletion {
    pub fn to_response_body(&self) -> serde_json::Value {
        json!({
            "choices": [{
                "message": ChatMessage::assistant(self.content.clone()),
                "finish_reason": self.finish_reason,
            }],
        })
    }
}

pub struct StreamRelay {
    key_id: String,
    persona: Arc<Persona>,
    conversation: Vec<ChatMessage>,
    limiter: Arc<KeyLimiter>,
    store: Arc<dyn TamperStore>,
    observability: Arc<Observability>,
    idle_timeout: Duration,
    phase: RelayPhase,
    upstream: Option<ChunkStream>,
    generated: String,
    charged_chunks: u64,
    finish_reason: FinishReason,
}

impl std::fmt::Debug for StreamRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRelay")
            .field("key_id", &self.key_id)
            .field("persona", &self.persona.name)
            .field("phase", &self.phase)
            .field("charged_chunks", &self.charged_chunks)
            .field("finish_reason", &self.finish_reason)
            .finish_non_exhaustive()
    }
}

impl StreamRelay {
    /// `conversation` is the client's history, without the persona's system prompt.
    pub fn new(
        key_id: impl Into<String>,
        persona: Arc<Persona>,
        conversation: Vec<ChatMessage>,
        limiter: Arc<KeyLimiter>,
        store: Arc<dyn TamperStore>,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            persona,
            conversation,
            limiter,
            store,
            observability: Arc::new(Observability::default()),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            phase: RelayPhase::Idle,
            upstream: None,
            generated: String::new(),
            charged_chunks: 0,
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_observability(mut self, observability: Arc<Observability>) -> Self {
        self.observability = observability;
        self
    }

    pub fn phase(&self) -> RelayPhase {
        self.phase
    }

    pub fn generated(&self) -> &str {
        &self.generated
    }

    pub fn finish_reason(&self) -> FinishReason {
        self.finish_reason
    }

    /// Opens the upstream completion under the persona's real model and system prompt.
    pub async fn open(&mut self, upstream: &dyn ChatUpstream) -> Result<(), GatewayError> {
        if self.phase != RelayPhase::Idle {
            return Err(GatewayError::internal("relay opened twice"));
        }
        self.phase = RelayPhase::Prefacing;

        let mut messages = Vec::with_capacity(self.conversation.len() + 1);
        messages.push(ChatMessage::system(self.persona.system_prompt.clone()));
        messages.extend(self.conversation.iter().cloned());

        match upstream.stream(&self.persona.upstream_model, &messages).await {
            Ok(stream) => {
                tracing::debug!(
                    key_id = %self.key_id,
                    persona = %self.persona.name,
                    provider = upstream.provider(),
                    "upstream stream opened"
                );
                self.upstream = Some(stream);
                self.phase = RelayPhase::Draining;
                Ok(())
            }
            Err(err) => {
                self.phase = RelayPhase::Aborted;
                Err(err.into())
            }
        }
    }

    /// Next chunk to forward downstream, or `None` once the turn is finalized.
    ///
    /// A failed pull leaves the relay `Aborted` with nothing logged; streaming callers decide
    /// whether the partial turn is worth keeping via [`StreamRelay::abort_after_emit`].
    pub async fn next_chunk(&mut self) -> Result<Option<UpstreamChunk>, GatewayError> {
        match self.phase {
            RelayPhase::Draining => {}
            RelayPhase::Finalizing => {
                self.finalize(RelayPhase::Closed).await;
                return Ok(None);
            }
            RelayPhase::Closed | RelayPhase::Aborted => return Ok(None),
            RelayPhase::Idle | RelayPhase::Prefacing => {
                return Err(GatewayError::internal("relay drained before open"));
            }
        }

        let Some(upstream) = self.upstream.as_mut() else {
            return Err(GatewayError::internal("relay lost its upstream stream"));
        };

        let pulled = match tokio::time::timeout(self.idle_timeout, upstream.next()).await {
            Ok(pulled) => pulled,
            Err(_) => Some(Err(RoundtableError::Timeout(self.idle_timeout))),
        };

        let mut chunk = match pulled {
            None => {
                self.finalize(RelayPhase::Closed).await;
                return Ok(None);
            }
            Some(Err(err)) => {
                self.upstream = None;
                self.phase = RelayPhase::Aborted;
                return Err(err.into());
            }
            Some(Ok(chunk)) => chunk,
        };

        if chunk.finish_reason() == Some(FinishReason::Length.as_str()) {
            self.finish_reason = FinishReason::Length;
        }

        let Some(content) = chunk.content().map(str::to_owned) else {
            return Ok(Some(chunk));
        };

        if !self.limiter.try_consume_tokens(1) {
            chunk.truncate();
            self.finish_reason = FinishReason::Length;
            self.upstream = None;
            self.phase = RelayPhase::Finalizing;
            self.observability.record_truncated();
            tracing::info!(
                key_id = %self.key_id,
                persona = %self.persona.name,
                streamed_tokens = self.charged_chunks,
                "token budget exhausted mid-turn, truncating"
            );
            return Ok(Some(chunk));
        }

        self.generated.push_str(&content);
        self.charged_chunks += 1;
        self.observability.record_content_chunk();
        if self.charged_chunks % USAGE_LOG_INTERVAL == 0 {
            self.limiter.log_usage(&self.key_id, self.charged_chunks, "");
        }
        Ok(Some(chunk))
    }

    /// Keeps the part of the turn the client already received after a mid-stream failure.
    pub async fn abort_after_emit(&mut self) {
        self.upstream = None;
        if self.generated.is_empty() {
            self.phase = RelayPhase::Aborted;
            return;
        }
        self.finalize(RelayPhase::Aborted).await;
    }

    async fn finalize(&mut self, terminal: RelayPhase) {
        self.phase = RelayPhase::Finalizing;
        self.upstream = None;

        self.conversation
            .push(ChatMessage::assistant(self.generated.clone()));
        match serialize_conversation(&self.conversation) {
            Ok(serialized) => {
                if let Err(err) = self
                    .store
                    .insert_if_absent(&self.key_id, &self.persona.name, &serialized)
                    .await
                {
                    tracing::error!(
                        key_id = %self.key_id,
                        persona = %self.persona.name,
                        error = %err,
                        "failed to record generated turn"
                    );
                }
                self.limiter.log_usage(
                    &self.key_id,
                    self.charged_chunks,
                    &format!(", generated {serialized}"),
                );
            }
            Err(err) => {
                tracing::error!(key_id = %self.key_id, error = %err, "failed to encode turn");
            }
        }

        self.phase = terminal;
        if terminal == RelayPhase::Closed {
            self.observability.record_completed();
        }
    }

    /// Drains the whole turn for a batched response.
    pub async fn collect(mut self) -> Result<BatchedCompletion, GatewayError> {
        while self.next_chunk().await?.is_some() {}
        Ok(BatchedCompletion {
            content: self.generated,
            finish_reason: self.finish_reason,
        })
    }

    /// SSE body: one `data:` frame per chunk, then `[DONE]`, or an error frame on failure.
    ///
    /// Dropping the returned stream drops the upstream connection without logging the turn.
    pub fn into_sse_body_stream(self) -> BoxStream<'static, Result<Bytes, std::io::Error>> {
        futures_util::stream::unfold(Some(self), |relay| async move {
            let mut relay = relay?;
            match relay.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk.to_sse_frame()), Some(relay))),
                Ok(None) => Some((Ok(Bytes::from_static(DONE_FRAME)), None)),
                Err(err) => {
                    tracing::warn!(
                        key_id = %relay.key_id,
                        persona = %relay.persona.name,
                        error = %err,
                        "upstream failed mid-stream"
                    );
                    relay.observability.record_aborted();
                    relay.abort_after_emit().await;
                    Some((Ok(error_frame(&err)), None))
                }
            }
        })
        .boxed()
    }
}

fn error_frame(err: &GatewayError) -> Bytes {
    let body = match err {
        GatewayError::Upstream { status, body } => {
            OpenAiErrorResponse::new("upstream_error", body.clone()).with_code(status.to_string())
        }
        _ => OpenAiErrorResponse::internal(),
    };
    let encoded = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {encoded}\n\n"))
}
