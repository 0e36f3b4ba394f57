//! A generation engine backed by a locally launched runtime process.
//!
//! The default, vllm and llama.cpp engines differ only in how the runtime is
//! started. Once it answers on its OpenAI-compatible API they are served the
//! same way.

use serde_json::Value;

use crate::runtime::ManagedServer;

use super::openai_compat::OpenAiCompatClient;
use super::{ChatCompletionRequest, ChunkStream, CompletionRequest, EngineError};

#[derive(Debug)]
pub struct LocalEngine {
    client: OpenAiCompatClient,
    /// `None` when attached to a runtime this process does not own.
    server: Option<ManagedServer>,
    model_name: String,
    /// `model_name` followed by any adapter names.
    served_models: Vec<String>,
}

impl LocalEngine {
    /// Wrap a launched runtime.
    pub fn launched(
        server: ManagedServer,
        timeout_seconds: u64,
        model_name: String,
        extra_models: Vec<String>,
    ) -> Result<Self, EngineError> {
        let client = OpenAiCompatClient::new(server.base_url(), timeout_seconds)?;
        Ok(Self::assemble(client, Some(server), model_name, extra_models))
    }

    /// Use an OpenAI-compatible runtime that is already running elsewhere.
    pub fn attach(
        client: OpenAiCompatClient,
        model_name: String,
        extra_models: Vec<String>,
    ) -> Self {
        Self::assemble(client, None, model_name, extra_models)
    }

    fn assemble(
        client: OpenAiCompatClient,
        server: Option<ManagedServer>,
        model_name: String,
        extra_models: Vec<String>,
    ) -> Self {
        let mut served_models = vec![model_name.clone()];
        served_models.extend(extra_models.into_iter().filter(|m| *m != model_name));
        Self { client, server, model_name, served_models }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn served_models(&self) -> &[String] {
        &self.served_models
    }

    /// Requested model if this engine serves it, else the base model.
    fn target_model(&self, requested: Option<&str>) -> String {
        match requested {
            Some(m) if self.served_models.iter().any(|s| s == m) => m.to_string(),
            _ => self.model_name.clone(),
        }
    }

    fn chat_body(&self, mut request: ChatCompletionRequest, stream: bool) -> ChatCompletionRequest {
        request.model = Some(self.target_model(request.model.as_deref()));
        request.stream = stream;
        request
    }

    fn completion_body(&self, mut request: CompletionRequest, stream: bool) -> CompletionRequest {
        request.model = Some(self.target_model(request.model.as_deref()));
        request.stream = stream;
        request
    }

    pub async fn chat(&self, request: ChatCompletionRequest) -> Result<Value, EngineError> {
        let body = self.chat_body(request, false);
        self.client.post_json("/v1/chat/completions", &body).await
    }

    pub async fn chat_stream(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChunkStream, EngineError> {
        let body = self.chat_body(request, true);
        self.client.post_stream("/v1/chat/completions", &body).await
    }

    pub async fn completion(&self, request: CompletionRequest) -> Result<Value, EngineError> {
        let body = self.completion_body(request, false);
        self.client.post_json("/v1/completions", &body).await
    }

    pub async fn completion_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<ChunkStream, EngineError> {
        let body = self.completion_body(request, true);
        self.client.post_stream("/v1/completions", &body).await
    }

    pub async fn health(&self) -> Result<(), EngineError> {
        self.client.health("/health").await
    }

    pub async fn shutdown(&self) {
        if let Some(server) = &self.server {
            server.shutdown().await;
        }
    }
}
