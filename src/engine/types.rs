//! OpenAI-style request bodies accepted by every engine.
//!
//! Only the fields the service itself inspects are typed. Everything else
//! (sampling parameters, tools, response_format, …) is carried in `extra`
//! and forwarded to the runtime untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of `POST /chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of `POST /completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// A string or an array of strings.
    pub prompt: Value,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CompletionRequest {
    /// The prompt as one string, if it is a string or a one-element array.
    pub fn single_prompt(&self) -> Option<&str> {
        match &self.prompt {
            Value::String(s) => Some(s),
            Value::Array(items) if items.len() == 1 => items[0].as_str(),
            _ => None,
        }
    }
}
