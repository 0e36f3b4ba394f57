//! llm-serve: OpenAI-style chat, completion and RAG endpoints over one
//! pluggable generation engine.

pub mod config;
pub mod engine;
pub mod error;
pub mod logger;
pub mod models;
pub mod rag;
pub mod runtime;
pub mod server;
