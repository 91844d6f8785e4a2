//! Typed helpers around the engine's JSON payloads.
//!
//! The session passes options and responses through as strings. These types
//! are for callers that want to build options or read responses without
//! hand-writing JSON.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Response buffer capacity for a generation of up to `max_tokens` tokens.
pub fn response_buffer_size(max_tokens: usize) -> usize {
    8 * max_tokens + 256
}

/// Drop a leading `file://` from a local path.
pub fn strip_file_scheme(path: &str) -> &str {
    path.strip_prefix("file://").unwrap_or(path)
}

/// Sampling options for `complete` and `transcribe`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompleteOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// Transcription accepts the same knobs.
pub type TranscribeOptions = CompleteOptions;

impl CompleteOptions {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Buffer size matching `max_tokens`, or `default_max_tokens` when unset.
    pub fn buffer_size(&self, default_max_tokens: usize) -> usize {
        response_buffer_size(self.max_tokens.unwrap_or(default_max_tokens))
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Parsed engine response for `complete` and `transcribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub success: bool,
    #[serde(default)]
    pub response: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_calls: Vec<FunctionCall>,
    #[serde(default)]
    pub time_to_first_token_ms: f64,
    #[serde(default)]
    pub total_time_ms: f64,
    #[serde(default)]
    pub tokens_per_second: f64,
    #[serde(default)]
    pub prefill_tokens: u64,
    #[serde(default)]
    pub decode_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl CompletionResponse {
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
