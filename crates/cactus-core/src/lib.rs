//! Cactus Core - concurrency-safe session layer for on-device inference
//!
//! This crate exposes a single native inference engine (chat completion,
//! transcription, text/image/audio embeddings) to many async callers while
//! making sure only one of them touches the engine at a time.
//!
//! # Architecture
//!
//! - [`Session`] owns the engine handle and its has-model/no-model lifecycle
//! - [`Dispatcher`] runs each operation on the tokio blocking pool and hands
//!   back a [`Pending`] future
//! - [`TokenBridge`] forwards per-token engine callbacks to an optional sink
//! - [`TextBuffer`] / [`VectorBuffer`] implement the fixed-capacity output
//!   buffer protocol
//! - [`Utility`] wraps device registration and device id lookups
//!
//! # Example
//!
//! ```ignore
//! use cactus_core::{CompletionRequest, NativeEngine, Session};
//!
//! let session = Session::new(NativeEngine)?;
//! session.init("/models/qwen3-0.6", 2048, None).await?;
//!
//! let reply = session
//!     .complete(
//!         CompletionRequest::new(r#"[{"role":"user","content":"Hi"}]"#)
//!             .on_token(|token, _id| print!("{token}")),
//!     )
//!     .await?;
//! ```

pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod params;
pub mod request;
pub mod session;
pub mod stream;
pub mod util;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use buffer::{TextBuffer, VectorBuffer};
pub use config::{ServerConfig, SessionConfig};
pub use dispatch::{Dispatcher, Pending};
pub use engine::{DeviceRegistry, EmbeddingKind, Engine, Status};
pub use error::{Error, Result};
pub use params::{
    response_buffer_size, strip_file_scheme, CompleteOptions, CompletionResponse, FunctionCall,
    TranscribeOptions,
};
pub use request::{CompletionRequest, EmbeddingRequest, TranscriptionRequest};
pub use session::Session;
pub use stream::{token_channel, TokenBridge, TokenEvent, TokenSink, TokenStream};
pub use util::Utility;

#[cfg(feature = "native")]
pub use engine::{NativeEngine, NativeRegistry};
