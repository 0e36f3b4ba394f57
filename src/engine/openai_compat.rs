//! HTTP client for runtimes that speak the OpenAI wire protocol.
//!
//! Constructed once per engine, then cheaply cloned because
//! `reqwest::Client` is an `Arc` internally. Bodies are passed through as
//! JSON; the service does not reinterpret choices or usage.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, trace};

use super::{ChunkStream, EngineError};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    /// Bounded by `request_timeout_seconds`.
    client: Client,
    /// No total timeout: streams last as long as generation does.
    stream_client: Client,
    base_url: String,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, timeout_seconds: u64) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| EngineError::Request(format!("failed to build HTTP client: {e}")))?;
        let stream_client = Client::builder()
            .connect_timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| EngineError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            stream_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// POST a JSON body and return the JSON response.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<Value, EngineError> {
        let url = self.url(path);
        debug!(%url, "sending upstream request");
        if tracing::enabled!(tracing::Level::TRACE) {
            let json = serde_json::to_string_pretty(payload)
                .unwrap_or_else(|e| format!("<serialization failed: {e}>"));
            trace!(payload = %json, "full upstream request payload");
        }

        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| send_error(&url, e))?;
        let response = check_status(response).await?;

        response.json::<Value>().await.map_err(|e| {
            error!(error = %e, "failed to deserialize upstream response");
            EngineError::Request(format!("failed to parse response body: {e}"))
        })
    }

    /// POST a JSON body and return the response body as a byte stream.
    ///
    /// Used for `stream: true` requests; the runtime's SSE frames are
    /// forwarded unchanged.
    pub async fn post_stream<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<ChunkStream, EngineError> {
        let url = self.url(path);
        debug!(%url, "opening upstream stream");

        let response = self
            .stream_client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| send_error(&url, e))?;
        let response = check_status(response).await?;

        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|b| b.to_vec())
                .map_err(|e| EngineError::Request(format!("stream interrupted: {e}")))
        });
        Ok(Box::pin(stream))
    }

    /// GET `path` with a short timeout; any 2xx counts as healthy.
    pub async fn health(&self, path: &str) -> Result<(), EngineError> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| send_error(&url, e))?;
        check_status(response).await.map(|_| ())
    }
}

fn send_error(url: &str, e: reqwest::Error) -> EngineError {
    error!(%url, error = %e, "upstream HTTP request failed (transport)");
    if e.is_timeout() {
        EngineError::Timeout(e.to_string())
    } else {
        EngineError::Request(e.to_string())
    }
}

// Error envelope used by OpenAI and compatible APIs.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    code: Option<Value>,
}

// TGI's native error shape.
#[derive(Debug, Deserialize)]
struct FlatError {
    error: String,
}

/// Consume the response and return it if successful, or a structured error.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());

    let message = if let Ok(env) = serde_json::from_str::<ErrorEnvelope>(&body) {
        let code = env
            .error
            .code
            .map(|v| match v {
                Value::String(s) => format!(" [code={s}]"),
                other => format!(" [code={other}]"),
            })
            .unwrap_or_default();
        format!("{}{code}", env.error.message)
    } else if let Ok(flat) = serde_json::from_str::<FlatError>(&body) {
        flat.error
    } else {
        body
    };

    error!(%status, %message, "upstream returned HTTP error");
    Err(EngineError::Upstream { status: status.as_u16(), message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use futures_util::StreamExt;
    use serde_json::json;

    async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn post_json_passes_body_through() {
        let app = axum::Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move { Json(json!({"echo": body})) }),
        );
        let client = OpenAiCompatClient::new(serve(app).await, 5).unwrap();
        let out = client
            .post_json("/v1/chat/completions", &json!({"model": "m"}))
            .await
            .unwrap();
        assert_eq!(out["echo"]["model"], "m");
    }

    #[tokio::test]
    async fn error_envelope_is_unwrapped() {
        let app = axum::Router::new().route(
            "/v1/completions",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": {"message": "prompt too long", "code": 400}})),
                )
            }),
        );
        let client = OpenAiCompatClient::new(serve(app).await, 5).unwrap();
        let err = client.post_json("/v1/completions", &json!({})).await.unwrap_err();
        match err {
            EngineError::Upstream { status, message } => {
                assert_eq!(status, 400);
                assert!(message.contains("prompt too long"));
                assert!(message.contains("[code=400]"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn flat_error_is_unwrapped() {
        let app = axum::Router::new().route(
            "/generate",
            post(|| async {
                (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"error": "bad input"})))
            }),
        );
        let client = OpenAiCompatClient::new(serve(app).await, 5).unwrap();
        let err = client.post_json("/generate", &json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::Upstream { status: 422, ref message } if message == "bad input"));
    }

    #[tokio::test]
    async fn stream_yields_raw_bytes() {
        let app = axum::Router::new().route(
            "/v1/completions",
            post(|| async { "data: {\"x\":1}\n\ndata: [DONE]\n\n" }),
        );
        let client = OpenAiCompatClient::new(serve(app).await, 5).unwrap();
        let mut stream = client.post_stream("/v1/completions", &json!({})).await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend(chunk.unwrap());
        }
        assert!(String::from_utf8(collected).unwrap().ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn health_checks_status() {
        let app = axum::Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/sick", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let client = OpenAiCompatClient::new(serve(app).await, 5).unwrap();
        assert!(client.health("/health").await.is_ok());
        assert!(client.health("/sick").await.is_err());
    }

    #[tokio::test]
    async fn unreachable_upstream_is_request_error() {
        let port = crate::runtime::pick_port().unwrap();
        let client = OpenAiCompatClient::new(format!("http://127.0.0.1:{port}/"), 2).unwrap();
        assert_eq!(client.base_url(), format!("http://127.0.0.1:{port}"));
        let err = client.post_json("/v1/models", &json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::Request(_)));
    }
}
