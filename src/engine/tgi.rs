//! Remote engine: a text-generation-inference server.
//!
//! Chat goes to TGI's OpenAI-compatible messages API. Completions use the
//! native `/generate` route, and the result is reshaped into an OpenAI
//! `text_completion` object. Both chat paths report the configured model
//! name instead of TGI's placeholder id.

use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::config::Config;

use super::openai_compat::OpenAiCompatClient;
use super::{ChatCompletionRequest, ChunkStream, CompletionRequest, EngineError, LlmEngine};

#[derive(Debug, Clone)]
pub struct TgiEngine {
    client: OpenAiCompatClient,
    model_name: String,
    served_models: Vec<String>,
}

impl TgiEngine {
    /// Build the client. Does not contact the server.
    pub fn new(config: &Config) -> Result<Self, EngineError> {
        let tgi = &config.engines.tgi;
        let client = OpenAiCompatClient::new(&tgi.endpoint, tgi.timeout_seconds)?;
        info!(endpoint = %tgi.endpoint, model = %config.model.model_name, "tgi client ready");
        Ok(Self {
            client,
            model_name: config.model.model_name.clone(),
            served_models: vec![config.model.model_name.clone()],
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn served_models(&self) -> &[String] {
        &self.served_models
    }

    // TGI serves exactly one model and ignores the name; send "tgi" like its docs.
    fn chat_body(mut request: ChatCompletionRequest, stream: bool) -> ChatCompletionRequest {
        request.model = Some("tgi".to_string());
        request.stream = stream;
        request
    }

    pub async fn chat(&self, request: ChatCompletionRequest) -> Result<Value, EngineError> {
        let mut out = self
            .client
            .post_json("/v1/chat/completions", &Self::chat_body(request, false))
            .await?;
        if let Some(obj) = out.as_object_mut() {
            obj.insert("model".into(), Value::String(self.model_name.clone()));
        }
        Ok(out)
    }

    pub async fn chat_stream(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChunkStream, EngineError> {
        let upstream = self
            .client
            .post_stream("/v1/chat/completions", &Self::chat_body(request, true))
            .await?;
        Ok(rename_stream_model(upstream, self.model_name.clone()))
    }

    pub async fn completion(&self, request: CompletionRequest) -> Result<Value, EngineError> {
        let prompt = request.single_prompt().ok_or_else(|| {
            EngineError::BadRequest("tgi engine accepts a single string prompt".into())
        })?;
        let body = GenerateRequest {
            inputs: prompt.to_string(),
            parameters: generate_parameters(&request.extra),
        };

        let raw = self.client.post_json("/generate", &body).await?;
        let parsed: GenerateResponse = serde_json::from_value(raw)
            .map_err(|e| EngineError::Request(format!("failed to parse /generate body: {e}")))?;
        Ok(to_text_completion(&self.model_name, parsed))
    }

    pub async fn completion_stream(
        &self,
        _request: CompletionRequest,
    ) -> Result<ChunkStream, EngineError> {
        Err(EngineError::BadRequest(
            "streaming completions are not supported by the tgi engine".into(),
        ))
    }

    pub async fn health(&self) -> Result<(), EngineError> {
        self.client.health("/health").await
    }

    /// Nothing to release; the server is not ours.
    pub async fn shutdown(&self) {}
}

pub fn create(config: &Config) -> Result<LlmEngine, EngineError> {
    Ok(LlmEngine::Tgi(TgiEngine::new(config)?))
}

// ── Streamed chat ─────────────────────────────────────────────────────────────

/// Rewrite `model` in every SSE `data:` event. Chunks are re-cut on line
/// boundaries so an event split across reads is still rewritten.
fn rename_stream_model(upstream: ChunkStream, model: String) -> ChunkStream {
    let state = (upstream, Vec::<u8>::new(), model, false);
    Box::pin(stream::unfold(state, |(mut upstream, mut pending, model, done)| async move {
        if done {
            return None;
        }
        loop {
            match upstream.next().await {
                Some(Ok(chunk)) => {
                    pending.extend_from_slice(&chunk);
                    let Some(end) = pending.iter().rposition(|b| *b == b'\n') else {
                        continue;
                    };
                    let rest = pending.split_off(end + 1);
                    let out = rename_lines(&pending, &model);
                    return Some((Ok(out), (upstream, rest, model, false)));
                }
                Some(Err(e)) => return Some((Err(e), (upstream, pending, model, true))),
                None if pending.is_empty() => return None,
                None => {
                    let out = rename_lines(&pending, &model);
                    return Some((Ok(out), (upstream, Vec::new(), model, true)));
                }
            }
        }
    }))
}

fn rename_lines(block: &[u8], model: &str) -> Vec<u8> {
    let text = String::from_utf8_lossy(block);
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let (body, eol) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };
        let (body, cr) = match body.strip_suffix('\r') {
            Some(body) => (body, "\r"),
            None => (body, ""),
        };
        match rename_event(body, model) {
            Some(renamed) => out.push_str(&renamed),
            None => out.push_str(body),
        }
        out.push_str(cr);
        out.push_str(eol);
    }
    out.into_bytes()
}

/// `None` leaves the line untouched (`[DONE]`, comments, events without `model`).
fn rename_event(line: &str, model: &str) -> Option<String> {
    let payload = line.strip_prefix("data:")?.trim_start();
    let mut event: Value = serde_json::from_str(payload).ok()?;
    let obj = event.as_object_mut()?;
    if !obj.contains_key("model") {
        return None;
    }
    obj.insert("model".into(), Value::String(model.to_string()));
    Some(format!("data: {event}"))
}

// ── Native wire types ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateRequest {
    inputs: String,
    parameters: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    generated_text: String,
    #[serde(default)]
    details: Option<GenerateDetails>,
}

#[derive(Debug, Deserialize)]
struct GenerateDetails {
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    generated_tokens: Option<u64>,
}

/// Map OpenAI sampling fields onto `/generate` parameters.
fn generate_parameters(extra: &Map<String, Value>) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("details".into(), Value::Bool(true));

    for (from, to) in [
        ("max_tokens", "max_new_tokens"),
        ("temperature", "temperature"),
        ("top_p", "top_p"),
        ("seed", "seed"),
        ("frequency_penalty", "frequency_penalty"),
    ] {
        if let Some(v) = extra.get(from).filter(|v| !v.is_null()) {
            params.insert(to.into(), v.clone());
        }
    }

    match extra.get("stop") {
        Some(Value::String(s)) => {
            params.insert("stop".into(), json!([s]));
        }
        Some(Value::Array(items)) => {
            params.insert("stop".into(), Value::Array(items.clone()));
        }
        _ => {}
    }

    // TGI rejects temperature 0; treat it as greedy decoding.
    if params.get("temperature").and_then(Value::as_f64) == Some(0.0) {
        params.remove("temperature");
        params.insert("do_sample".into(), Value::Bool(false));
    }

    params
}

fn to_text_completion(model: &str, resp: GenerateResponse) -> Value {
    let (finish_reason, tokens) = match resp.details {
        Some(d) => (d.finish_reason, d.generated_tokens),
        None => (None, None),
    };
    let finish_reason = match finish_reason.as_deref() {
        Some("length") => "length",
        _ => "stop",
    };

    let mut out = json!({
        "id": format!("cmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "text_completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "text": resp.generated_text,
            "logprobs": null,
            "finish_reason": finish_reason,
        }],
    });
    if let Some(n) = tokens {
        out["usage"] = json!({ "completion_tokens": n });
    }
    out
}
