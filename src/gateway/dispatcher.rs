use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::model::ChatUpstream;
use crate::types::{ChatMessage, Role};

use super::config::{ApiKeyConfig, GatewayConfig};
use super::limits::{KeyLimiter, LimitsConfig, RateLimitHeaders, RateLimiter};
use super::observability::Observability;
use super::personas::{Persona, PersonaRegistry};
use super::relay::{BatchedCompletion, DEFAULT_IDLE_TIMEOUT, StreamRelay, TransportMode};
use super::tamper_log::TamperStore;
use super::validator::ConversationValidator;
use super::{Clock, GatewayError};

/// A chat request that passed shape validation and names a known persona.
#[derive(Clone, Debug)]
pub struct ChatCompletionRequest {
    pub persona: Arc<Persona>,
    pub messages: Vec<ChatMessage>,
    pub mode: TransportMode,
}

impl ChatCompletionRequest {
    /// Checks run in a fixed order so the first problem found is the one reported.
    pub fn parse(body: &[u8], personas: &PersonaRegistry) -> Result<Self, GatewayError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|_| GatewayError::invalid_request("Invalid JSON"))?;

        let persona = value
            .get("model")
            .and_then(Value::as_str)
            .and_then(|model| personas.get(model))
            .ok_or_else(|| GatewayError::invalid_request("Invalid or missing model"))?;

        let messages = match value.get("messages") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(idx, item)| parse_message(idx, item))
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(GatewayError::invalid_request(
                    "Valid messages array is required",
                ));
            }
        };

        let stream = value
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            persona,
            messages,
            mode: TransportMode::from_stream_flag(stream),
        })
    }
}

fn parse_message(idx: usize, item: &Value) -> Result<ChatMessage, GatewayError> {
    let Some(obj) = item.as_object() else {
        return Err(GatewayError::invalid_request(format!(
            "messages[{idx}] must be an object"
        )));
    };
    let role = obj
        .get("role")
        .and_then(Value::as_str)
        .and_then(Role::parse)
        .ok_or_else(|| {
            GatewayError::invalid_request(format!(
                "messages[{idx}].role must be one of system, user, assistant"
            ))
        })?;
    let content = obj
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            GatewayError::invalid_request(format!("messages[{idx}].content must be a string"))
        })?;
    Ok(ChatMessage {
        role,
        content: content.to_string(),
    })
}

/// Outcome of a request that was admitted and reached the upstream.
pub enum Dispatched {
    /// The relay is opened and waiting to be drained into an SSE body.
    Streaming {
        headers: RateLimitHeaders,
        relay: StreamRelay,
    },
    Batched {
        headers: RateLimitHeaders,
        completion: BatchedCompletion,
    },
}

impl std::fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming { headers, relay } => f
                .debug_struct("Streaming")
                .field("headers", headers)
                .field("relay", relay)
                .finish(),
            Self::Batched {
                headers,
                completion,
            } => f
                .debug_struct("Batched")
                .field("headers", headers)
                .field("completion", completion)
                .finish(),
        }
    }
}

/// A refused request, with the budget snapshot when it got far enough to take one.
#[derive(Debug)]
pub struct Rejected {
    pub error: GatewayError,
    pub headers: Option<RateLimitHeaders>,
}

impl Rejected {
    fn with_headers(error: GatewayError, headers: RateLimitHeaders) -> Self {
        Self {
            error,
            headers: Some(headers),
        }
    }
}

impl From<GatewayError> for Rejected {
    fn from(error: GatewayError) -> Self {
        let headers = match &error {
            GatewayError::RateLimited { headers } => Some(headers.clone()),
            _ => None,
        };
        Self { error, headers }
    }
}

/// Runs one chat request from bearer token to an opened relay.
pub struct Dispatcher {
    personas: Arc<PersonaRegistry>,
    key_ids_by_token: HashMap<String, String>,
    limiter: RateLimiter,
    validator: ConversationValidator,
    store: Arc<dyn TamperStore>,
    upstream: Arc<dyn ChatUpstream>,
    observability: Arc<Observability>,
    idle_timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("personas", &self.personas.len())
            .field("keys", &self.key_ids_by_token.len())
            .field("upstream", &self.upstream.provider())
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        personas: PersonaRegistry,
        clock: Arc<dyn Clock>,
        store: Arc<dyn TamperStore>,
        upstream: Arc<dyn ChatUpstream>,
    ) -> Self {
        Self {
            personas: Arc::new(personas),
            key_ids_by_token: HashMap::new(),
            limiter: RateLimiter::new(clock),
            validator: ConversationValidator::new(store.clone()),
            store,
            upstream,
            observability: Arc::new(Observability::default()),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Personas and keys from `config`, falling back to the built-in tables when it lists none.
    pub fn from_config(
        config: &GatewayConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn TamperStore>,
        upstream: Arc<dyn ChatUpstream>,
    ) -> Self {
        let mut dispatcher = Self::new(config.persona_registry(), clock, store, upstream)
            .with_idle_timeout(Duration::from_secs(config.upstream.idle_timeout_secs));
        for key in config.resolved_api_keys() {
            dispatcher.register_api_key(&key, config.default_limits);
        }
        dispatcher
    }

    pub fn with_api_key(mut self, key: &ApiKeyConfig, default_limits: LimitsConfig) -> Self {
        self.register_api_key(key, default_limits);
        self
    }

    pub fn register_api_key(&mut self, key: &ApiKeyConfig, default_limits: LimitsConfig) {
        self.key_ids_by_token
            .insert(key.token.clone(), key.id.clone());
        self.limiter
            .register(key.id.clone(), key.limits(default_limits));
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_observability(mut self, observability: Arc<Observability>) -> Self {
        self.observability = observability;
        self
    }

    pub fn observability(&self) -> &Arc<Observability> {
        &self.observability
    }

    pub fn personas(&self) -> &PersonaRegistry {
        &self.personas
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn store(&self) -> &Arc<dyn TamperStore> {
        &self.store
    }

    fn resolve_key(&self, token: &str) -> Option<(&str, Arc<KeyLimiter>)> {
        let key_id = self.key_ids_by_token.get(token)?;
        let limiter = self.limiter.get(key_id)?;
        Some((key_id.as_str(), limiter))
    }

    pub async fn dispatch(&self, token: &str, body: &[u8]) -> Result<Dispatched, Rejected> {
        self.observability.record_request();
        let result = self.dispatch_inner(token, body).await;
        if let Err(rejected) = &result {
            self.record_rejection(&rejected.error);
        }
        result
    }

    async fn dispatch_inner(&self, token: &str, body: &[u8]) -> Result<Dispatched, Rejected> {
        let Some((key_id, limiter)) = self.resolve_key(token) else {
            tracing::warn!("rejecting request with unknown api key");
            return Err(GatewayError::Unauthorized.into());
        };

        let request = ChatCompletionRequest::parse(body, &self.personas).map_err(|err| {
            tracing::warn!(key_id, error = %err, "rejecting malformed request");
            err
        })?;
        let persona = request.persona;

        self.validator
            .validate(key_id, &persona.name, &request.messages)
            .await?;

        let headers = limiter.snapshot_headers();
        if limiter.is_exhausted() || !limiter.try_consume_request() {
            tracing::info!(key_id, persona = %persona.name, "rate limit exceeded");
            return Err(GatewayError::RateLimited {
                headers: limiter.snapshot_headers(),
            }
            .into());
        }

        let mut relay = StreamRelay::new(
            key_id,
            persona,
            request.messages,
            limiter,
            self.store.clone(),
        )
        .with_idle_timeout(self.idle_timeout)
        .with_observability(self.observability.clone());

        relay
            .open(self.upstream.as_ref())
            .await
            .map_err(|err| Rejected::with_headers(err, headers.clone()))?;

        match request.mode {
            TransportMode::Streaming => Ok(Dispatched::Streaming { headers, relay }),
            TransportMode::Batched => match relay.collect().await {
                Ok(completion) => Ok(Dispatched::Batched {
                    headers,
                    completion,
                }),
                Err(err) => Err(Rejected::with_headers(err, headers)),
            },
        }
    }

    fn record_rejection(&self, error: &GatewayError) {
        match error {
            GatewayError::Unauthorized => self.observability.record_unauthorized(),
            GatewayError::InvalidRequest { .. } => self.observability.record_invalid_request(),
            GatewayError::TamperedHistory => self.observability.record_tampered(),
            GatewayError::RateLimited { .. } => self.observability.record_rate_limited(),
            GatewayError::Upstream { status, .. } => {
                tracing::warn!(status, "upstream rejected the completion");
                self.observability.record_upstream_error();
            }
            GatewayError::Internal { message } => {
                tracing::error!(error = %message, "chat request failed");
                self.observability.record_internal_error();
            }
        }
    }
}
