//! Configuration types for the Cactus session layer

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Context window used when a caller does not ask for one.
pub const DEFAULT_CONTEXT_SIZE: usize = 2048;

/// Embedding buffer capacity, in `f32` elements.
pub const DEFAULT_EMBEDDING_BUFFER_SIZE: usize = 2048;

/// Token budget used to size completion buffers.
pub const DEFAULT_MAX_TOKENS: usize = 512;

/// Session defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory holding downloaded model folders
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Context window passed to `init`
    #[serde(default = "default_context_size")]
    pub context_size: usize,

    /// Capacity of embedding buffers (elements)
    #[serde(default = "default_embedding_buffer_size")]
    pub embedding_buffer_size: usize,

    /// Token budget used to size completion and transcription buffers
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            context_size: default_context_size(),
            embedding_buffer_size: default_embedding_buffer_size(),
            default_max_tokens: default_max_tokens(),
        }
    }
}

impl SessionConfig {
    /// Resolve a model name against `models_dir`. Absolute paths are returned as-is.
    pub fn model_path(&self, model: &str) -> PathBuf {
        let candidate = PathBuf::from(model);
        if candidate.is_absolute() {
            candidate
        } else {
            self.models_dir.join(model)
        }
    }
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cactus")
        .join("models")
}

fn default_context_size() -> usize {
    DEFAULT_CONTEXT_SIZE
}

fn default_embedding_buffer_size() -> usize {
    DEFAULT_EMBEDDING_BUFFER_SIZE
}

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,

    /// Model to load at startup; the session starts empty when unset
    #[serde(default)]
    pub model_path: Option<String>,

    #[serde(default)]
    pub corpus_dir: Option<String>,

    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_cors_enabled(),
            model_path: None,
            corpus_dir: None,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cors_enabled() -> bool {
    true
}
