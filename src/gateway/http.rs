use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;

use super::dispatcher::{Dispatched, Dispatcher, Rejected};
use super::limits::RateLimitHeaders;
use super::{GatewayError, ObservabilitySnapshot};

const INTERNAL_ERROR_MESSAGE: &str = "An unexpected error occurred";

#[derive(Clone)]
pub struct GatewayHttpState {
    dispatcher: Arc<Dispatcher>,
}

impl std::fmt::Debug for GatewayHttpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayHttpState")
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl GatewayHttpState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self::with_shared_dispatcher(Arc::new(dispatcher))
    }

    pub fn with_shared_dispatcher(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics(State(state): State<GatewayHttpState>) -> Json<ObservabilitySnapshot> {
    Json(state.dispatcher.observability().snapshot())
}

async fn handle_chat_completions(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = extract_api_key(&headers);
    match state.dispatcher.dispatch(&token, &body).await {
        Ok(Dispatched::Streaming { headers, relay }) => {
            let mut response = Response::new(Body::from_stream(relay.into_sse_body_stream()));
            let out = response.headers_mut();
            out.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            out.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            out.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            apply_rate_limit_headers(out, &headers);
            response
        }
        Ok(Dispatched::Batched {
            headers,
            completion,
        }) => {
            let mut response = Json(completion.to_response_body()).into_response();
            apply_rate_limit_headers(response.headers_mut(), &headers);
            response
        }
        Err(rejected) => rejection_response(rejected),
    }
}

/// The token is the last space-separated word of `Authorization`, so a bare key works too.
fn extract_api_key(headers: &HeaderMap) -> String {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().rsplit(' ').next())
        .unwrap_or_default()
        .to_string()
}

fn apply_rate_limit_headers(out: &mut HeaderMap, headers: &RateLimitHeaders) {
    for (name, value) in headers.pairs() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            out.insert(HeaderName::from_static(name), value);
        }
    }
}

fn rejection_response(rejected: Rejected) -> Response {
    let Rejected { error, headers } = rejected;
    let mut response = match &error {
        GatewayError::Upstream { status, body } => {
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, body.clone()).into_response()
        }
        GatewayError::RateLimited { .. } => openai_error(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            error.to_string(),
        )
        .into_response(),
        GatewayError::Internal { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(OpenAiErrorResponse::internal()),
        )
            .into_response(),
        GatewayError::Unauthorized
        | GatewayError::InvalidRequest { .. }
        | GatewayError::TamperedHistory => openai_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            error.to_string(),
        )
        .into_response(),
    };
    if let Some(headers) = headers {
        apply_rate_limit_headers(response.headers_mut(), &headers);
    }
    response
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    param: Option<String>,
    code: Option<String>,
}

/// `{"error":{"message","type","param","code"}}`, the shape OpenAI clients already parse.
#[derive(Debug, Serialize)]
pub(crate) struct OpenAiErrorResponse {
    error: OpenAiErrorDetail,
}

impl OpenAiErrorResponse {
    pub(crate) fn new(kind: &'static str, message: impl std::fmt::Display) -> Self {
        Self {
            error: OpenAiErrorDetail {
                message: message.to_string(),
                kind,
                param: None,
                code: None,
            },
        }
    }

    pub(crate) fn internal() -> Self {
        Self::new("internal_server_error", INTERNAL_ERROR_MESSAGE)
    }

    pub(crate) fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error.code = Some(code.into());
        self
    }
}

fn openai_error(
    status: StatusCode,
    kind: &'static str,
    message: impl std::fmt::Display,
) -> (StatusCode, Json<OpenAiErrorResponse>) {
    (status, Json(OpenAiErrorResponse::new(kind, message)))
}
