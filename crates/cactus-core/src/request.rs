//! Per-call parameter bundles.
//!
//! A request is built by the caller, moved into the worker that runs it and
//! dropped when the call finishes. Messages, options and tools are opaque JSON
//! strings passed through to the engine untouched.

use std::fmt;

use crate::config::{DEFAULT_EMBEDDING_BUFFER_SIZE, DEFAULT_MAX_TOKENS};
use crate::engine::EmbeddingKind;
use crate::params::response_buffer_size;
use crate::stream::TokenSink;

/// Chat completion request.
pub struct CompletionRequest {
    pub messages_json: String,
    pub buffer_size: usize,
    pub options_json: Option<String>,
    pub tools_json: Option<String>,
    pub sink: Option<TokenSink>,
}

impl CompletionRequest {
    pub fn new(messages_json: impl Into<String>) -> Self {
        Self {
            messages_json: messages_json.into(),
            buffer_size: response_buffer_size(DEFAULT_MAX_TOKENS),
            options_json: None,
            tools_json: None,
            sink: None,
        }
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn options(mut self, options_json: impl Into<String>) -> Self {
        self.options_json = Some(options_json.into());
        self
    }

    pub fn tools(mut self, tools_json: impl Into<String>) -> Self {
        self.tools_json = Some(tools_json.into());
        self
    }

    pub fn on_token<F>(mut self, sink: F) -> Self
    where
        F: FnMut(&str, u32) + Send + 'static,
    {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn sink(mut self, sink: TokenSink) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl fmt::Debug for CompletionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRequest")
            .field("messages_len", &self.messages_json.len())
            .field("buffer_size", &self.buffer_size)
            .field("has_options", &self.options_json.is_some())
            .field("has_tools", &self.tools_json.is_some())
            .field("streaming", &self.sink.is_some())
            .finish()
    }
}

/// Speech-to-text request.
pub struct TranscriptionRequest {
    pub audio_path: String,
    pub prompt: String,
    pub buffer_size: usize,
    pub options_json: Option<String>,
    pub sink: Option<TokenSink>,
}

impl TranscriptionRequest {
    pub fn new(audio_path: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            audio_path: audio_path.into(),
            prompt: prompt.into(),
            buffer_size: response_buffer_size(DEFAULT_MAX_TOKENS),
            options_json: None,
            sink: None,
        }
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn options(mut self, options_json: impl Into<String>) -> Self {
        self.options_json = Some(options_json.into());
        self
    }

    pub fn on_token<F>(mut self, sink: F) -> Self
    where
        F: FnMut(&str, u32) + Send + 'static,
    {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn sink(mut self, sink: TokenSink) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl fmt::Debug for TranscriptionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscriptionRequest")
            .field("audio_path", &self.audio_path)
            .field("buffer_size", &self.buffer_size)
            .field("has_options", &self.options_json.is_some())
            .field("streaming", &self.sink.is_some())
            .finish()
    }
}

/// Embedding request for any input modality.
#[derive(Debug, Clone)]
pub struct EmbeddingRequest {
    pub kind: EmbeddingKind,
    /// Text for [`EmbeddingKind::Text`], a file path otherwise
    pub input: String,
    /// Capacity in `f32` elements
    pub buffer_size: usize,
}

impl EmbeddingRequest {
    pub fn new(kind: EmbeddingKind, input: impl Into<String>) -> Self {
        Self {
            kind,
            input: input.into(),
            buffer_size: DEFAULT_EMBEDDING_BUFFER_SIZE,
        }
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}
