//! Persona gateway: budgets, tamper log, history validation and the streaming relay.

pub mod config;
pub mod dispatcher;
pub mod http;
pub mod limits;
pub mod observability;
pub mod personas;
pub mod relay;
pub mod tamper_log;
pub mod telemetry;
pub mod validator;

#[cfg(feature = "gateway-otel")]
pub mod otel;
#[cfg(feature = "gateway-store-sqlite")]
pub mod sqlite_store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::RoundtableError;

pub use config::{ApiKeyConfig, ConfigError, GatewayConfig, TamperStoreConfig, UpstreamConfig};
pub use dispatcher::{ChatCompletionRequest, Dispatched, Dispatcher, Rejected};
pub use http::GatewayHttpState;
pub use limits::{KeyBudget, KeyLimiter, LimitsConfig, RateLimitHeaders, RateLimiter};
pub use observability::{Observability, ObservabilitySnapshot};
pub use personas::{Persona, PersonaRegistry};
pub use relay::{BatchedCompletion, RelayPhase, StreamRelay, TransportMode};
pub use tamper_log::{MemoryTamperStore, TamperStore, TamperStoreError};
pub use validator::ConversationValidator;

#[cfg(feature = "gateway-store-sqlite")]
pub use sqlite_store::SqliteTamperStore;

/// Every failure a chat request can end in, each mapped to one HTTP response shape.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid API key")]
    Unauthorized,
    #[error("{message}")]
    InvalidRequest { message: String },
    #[error("Invalid message response (nice try)")]
    TamperedHistory,
    #[error("Rate limit exceeded")]
    RateLimited { headers: RateLimitHeaders },
    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::Internal {
            message: message.to_string(),
        }
    }
}

impl From<RoundtableError> for GatewayError {
    fn from(err: RoundtableError) -> Self {
        match err {
            RoundtableError::Api { status, body } => Self::Upstream {
                status: status.as_u16(),
                body,
            },
            other => Self::internal(other),
        }
    }
}

impl From<TamperStoreError> for GatewayError {
    fn from(err: TamperStoreError) -> Self {
        Self::internal(err)
    }
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Clock that only moves when told to; lets budget refill be exercised without sleeping.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now_ms.fetch_add(by, Ordering::SeqCst);
    }

    pub fn set_millis(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
