use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;

use crate::model::{ChatUpstream, ChunkStream};
use crate::types::{ChatMessage, UpstreamChunk};
use crate::utils::sse::sse_data_stream_from_response;
use crate::{Result, RoundtableError};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Streaming client for any `/chat/completions` endpoint speaking the OpenAI wire format.
#[derive(Clone)]
pub struct OpenAiCompatibleUpstream {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for OpenAiCompatibleUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleUpstream")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl OpenAiCompatibleUpstream {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_connect_timeout(api_key, Duration::from_secs(10))
    }

    pub fn with_connect_timeout(
        api_key: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }
}

async fn error_body(response: reqwest::Response) -> String {
    let mut body = Vec::<u8>::new();
    let mut truncated = false;
    let mut bytes = response.bytes_stream();
    while let Some(Ok(chunk)) = bytes.next().await {
        let remaining = MAX_ERROR_BODY_BYTES.saturating_sub(body.len());
        if chunk.len() > remaining {
            body.extend_from_slice(&chunk[..remaining]);
            truncated = true;
            break;
        }
        body.extend_from_slice(&chunk);
    }
    let mut text = String::from_utf8_lossy(&body).into_owned();
    if truncated {
        text.push_str("\n...(truncated)");
    }
    text
}

#[async_trait]
impl ChatUpstream for OpenAiCompatibleUpstream {
    fn provider(&self) -> &str {
        "openai-compatible"
    }

    async fn stream(&self, model: &str, messages: &[ChatMessage]) -> Result<ChunkStream> {
        let body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });

        let mut req = self
            .http
            .post(self.chat_completions_url())
            .header("Accept", "text/event-stream")
            .json(&body);
        if !self.api_key.trim().is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(RoundtableError::Api { status, body });
        }

        let chunks = sse_data_stream_from_response(response).map(|item| {
            let data = item?;
            UpstreamChunk::parse(&data).map_err(|err| {
                RoundtableError::InvalidResponse(format!("malformed upstream chunk: {err}"))
            })
        });
        Ok(chunks.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;

    #[tokio::test]
    async fn streams_parsed_chunks_until_done() -> crate::Result<()> {
        let server = MockServer::start();
        let sse = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hail\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-upstream")
                .json_body(json!({
                    "model": "gpt-4o-mini",
                    "messages": [{"role": "user", "content": "hi"}],
                    "stream": true,
                }));
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse);
        });

        let upstream = OpenAiCompatibleUpstream::new("sk-upstream")?
            .with_base_url(format!("{}/v1", server.base_url()));
        let mut stream = upstream
            .stream("gpt-4o-mini", &[ChatMessage::user("hi")])
            .await?;

        let mut contents = Vec::new();
        let mut finish = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if let Some(content) = chunk.content() {
                contents.push(content.to_string());
            }
            if let Some(reason) = chunk.finish_reason() {
                finish = Some(reason.to_string());
            }
        }

        assert_eq!(contents, vec!["Hail"]);
        assert_eq!(finish.as_deref(), Some("stop"));
        mock.assert();
        Ok(())
    }

    #[tokio::test]
    async fn non_success_status_surfaces_provider_body() -> crate::Result<()> {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(401).body("{\"error\":{\"message\":\"bad key\"}}");
        });

        let upstream = OpenAiCompatibleUpstream::new("sk-wrong")?.with_base_url(server.base_url());
        let err = match upstream.stream("m", &[ChatMessage::user("hi")]).await {
            Ok(_) => panic!("expected upstream error"),
            Err(err) => err,
        };
        match err {
            RoundtableError::Api { status, body } => {
                assert_eq!(status.as_u16(), 401);
                assert!(body.contains("bad key"));
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }
}
