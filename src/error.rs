//! Application-wide error types.

use thiserror::Error;

use crate::engine::EngineError;
use crate::rag::RagError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("rag error: {0}")]
    Rag(#[from] RagError),

    #[error("server error: {0}")]
    Server(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
