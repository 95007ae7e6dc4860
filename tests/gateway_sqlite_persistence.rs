#![cfg(feature = "gateway-store-sqlite")]

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use futures_util::StreamExt;
use futures_util::stream;
use roundtable::gateway::http::router;
use roundtable::gateway::{
    ApiKeyConfig, Dispatcher, GatewayHttpState, LimitsConfig, PersonaRegistry, SqliteTamperStore,
    SystemClock, TamperStore,
};
use roundtable::types::serialize_conversation;
use roundtable::{ChatMessage, ChatUpstream, ChunkStream, FinishReason, UpstreamChunk};
use serde_json::{Value, json};
use tower::util::ServiceExt;

struct FixedReply(&'static str);

#[async_trait]
impl ChatUpstream for FixedReply {
    fn provider(&self) -> &str {
        "fixed"
    }

    async fn stream(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
    ) -> roundtable::Result<ChunkStream> {
        let chunks: Vec<roundtable::Result<UpstreamChunk>> = vec![
            Ok(UpstreamChunk::content_delta(self.0)),
            Ok(UpstreamChunk::finished(FinishReason::Stop)),
        ];
        Ok(stream::iter(chunks).boxed())
    }
}

fn gateway(store: SqliteTamperStore) -> axum::Router {
    let dispatcher = Dispatcher::new(
        PersonaRegistry::round_table(),
        Arc::new(SystemClock),
        Arc::new(store),
        Arc::new(FixedReply("Hail")),
    )
    .with_api_key(
        &ApiKeyConfig::new("rubber-duck", "sk-rubber-duck"),
        LimitsConfig::default(),
    );
    router(GatewayHttpState::new(dispatcher))
}

async fn post(app: axum::Router, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-rubber-duck")
        .body(Body::from(body.to_string()))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, serde_json::from_slice(&bytes).expect("json"))
}

#[tokio::test]
async fn generated_turns_survive_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("responses.db");

    let store = SqliteTamperStore::new(&path);
    store.init().await.expect("init");
    let (status, _) = post(
        gateway(store),
        json!({"model": "arthur", "messages": [{"role": "user", "content": "Hello"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let reopened = SqliteTamperStore::new(&path);
    let logged = serialize_conversation(&[
        ChatMessage::user("Hello"),
        ChatMessage::assistant("Hail"),
    ])
    .expect("encode");
    assert!(
        reopened
            .exists("rubber-duck", "arthur", &logged)
            .await
            .expect("exists")
    );
    assert_eq!(reopened.count().await.expect("count"), 1);

    let (status, _) = post(
        gateway(reopened),
        json!({
            "model": "arthur",
            "messages": [
                {"role": "user", "content": "Hello"},
                {"role": "assistant", "content": "Hail"},
                {"role": "user", "content": "Again"},
            ],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn forged_history_is_rejected_against_sqlite_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteTamperStore::new(dir.path().join("responses.db"));
    store.init().await.expect("init");

    let (status, body) = post(
        gateway(store.clone()),
        json!({
            "model": "lancelot",
            "messages": [
                {"role": "user", "content": "Hello"},
                {"role": "assistant", "content": "Never logged"},
            ],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"]["message"],
        "Invalid message response (nice try)"
    );
    assert_eq!(store.count().await.expect("count"), 0);
}
