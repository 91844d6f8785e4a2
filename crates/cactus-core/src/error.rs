//! Error types for the Cactus session layer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cactus model is not initialized")]
    NotInitialized,

    #[error("Cactus model is already initialized")]
    AlreadyInitialized,

    #[error("Failed to initialize Cactus model from {0}")]
    InitializationFailed(String),

    #[error("Cactus completion failed (status {status})")]
    CompletionFailed { status: i32 },

    #[error("Cactus transcription failed (status {status})")]
    TranscriptionFailed { status: i32 },

    #[error("Cactus {kind} embedding failed (status {status})")]
    EmbeddingFailed {
        kind: crate::engine::EmbeddingKind,
        status: i32,
    },

    #[error("Failed to register app")]
    RegistrationFailed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Worker for `{operation}` failed: {message}")]
    WorkerFailed {
        operation: &'static str,
        message: String,
    },

    #[error("No tokio runtime available to dispatch session work")]
    NoRuntime,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the lifecycle errors raised by the has-handle/no-handle state machine.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Error::NotInitialized | Error::AlreadyInitialized)
    }
}
