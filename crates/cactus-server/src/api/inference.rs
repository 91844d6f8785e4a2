//! Completion, transcription and embedding endpoints

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use cactus_core::{
    token_channel, CompleteOptions, CompletionRequest, CompletionResponse, DeviceRegistry,
    EmbeddingKind, EmbeddingRequest, Engine, Session, TokenSink, TranscribeOptions,
    TranscriptionRequest,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Chat completion request
#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    /// Chat messages, forwarded to the engine unchanged
    pub messages: serde_json::Value,
    #[serde(default)]
    pub options: Option<CompleteOptions>,
    #[serde(default)]
    pub tools: Option<serde_json::Value>,
    /// Overrides `options.max_tokens` when both are set
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub stream: bool,
}

/// Transcription request
#[derive(Debug, Deserialize)]
pub struct TranscribeBody {
    pub audio_path: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub options: Option<TranscribeOptions>,
}

/// Embedding request
#[derive(Debug, Deserialize)]
pub struct EmbeddingsBody {
    pub input: String,
    #[serde(default)]
    pub kind: EmbeddingKind,
    #[serde(default)]
    pub buffer_size: Option<usize>,
}

/// Completion or transcription result
#[derive(Debug, Serialize)]
pub struct CompletionBody {
    pub id: String,
    #[serde(flatten)]
    pub result: CompletionResponse,
}

/// Embedding result
#[derive(Debug, Serialize)]
pub struct EmbeddingsResponse {
    pub embedding: Vec<f64>,
    pub dimension: usize,
    pub kind: EmbeddingKind,
}

/// One streamed token
#[derive(Debug, Serialize)]
struct TokenChunk<'a> {
    id: &'a str,
    token: String,
    token_id: u32,
}

/// Terminal stream event
#[derive(Debug, Serialize)]
struct StreamError<'a> {
    id: &'a str,
    error: String,
}

fn completion_id() -> String {
    format!("cmpl-{}", Uuid::new_v4().simple())
}

/// Event name and JSON data for one SSE frame.
///
/// A payload that fails to serialize becomes an `error` frame.
fn sse_frame<T: Serialize>(name: &'static str, payload: &T) -> (&'static str, String) {
    match serde_json::to_string(payload) {
        Ok(json) => (name, json),
        Err(e) => {
            let message = format!("Failed to serialize {} event: {}", name, e);
            warn!("{}", message);
            ("error", serde_json::json!({ "error": message }).to_string())
        }
    }
}

fn sse_event<T: Serialize>(name: &'static str, payload: &T) -> Event {
    let (name, data) = sse_frame(name, payload);
    Event::default().event(name).data(data)
}

/// Set while this request's generation holds the session.
///
/// Raised by the first token and cleared when the worker drops the sink,
/// which happens before the session lock is released.
struct GenerationFlag(Arc<AtomicBool>);

impl GenerationFlag {
    fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Drop for GenerationFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Wrap `sink` so `running` tracks whether its generation is in progress.
fn tracked_sink(mut sink: TokenSink, running: Arc<AtomicBool>) -> TokenSink {
    let flag = GenerationFlag(running);
    Box::new(move |token: &str, token_id: u32| {
        flag.raise();
        sink(token, token_id);
    })
}

/// Stops this request's generation if the client hangs up while it runs.
///
/// A request still queued behind another one never sends a stop, since that
/// would reach whichever generation currently holds the session.
struct StopOnDisconnect<E: Engine> {
    session: Session<E>,
    running: Arc<AtomicBool>,
}

impl<E: Engine> Drop for StopOnDisconnect<E> {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            debug!("Client disconnected, stopping generation");
            let _ = self.session.stop();
        }
    }
}

fn completion_request<E: Engine, R: DeviceRegistry>(
    state: &AppState<E, R>,
    body: &CompleteBody,
) -> Result<CompletionRequest, ApiError> {
    let mut options = body.options.clone().unwrap_or_default();
    if body.max_tokens.is_some() {
        options.max_tokens = body.max_tokens;
    }

    let messages = serde_json::to_string(&body.messages)
        .map_err(|e| ApiError::bad_request(format!("Invalid messages: {}", e)))?;
    let options_json = options.to_json()?;

    let mut request = CompletionRequest::new(messages)
        .buffer_size(options.buffer_size(state.config.default_max_tokens))
        .options(options_json);

    if let Some(tools) = &body.tools {
        let tools = serde_json::to_string(tools)
            .map_err(|e| ApiError::bad_request(format!("Invalid tools: {}", e)))?;
        request = request.tools(tools);
    }

    Ok(request)
}

/// Chat completion, optionally streamed as server-sent events
pub async fn complete<E: Engine, R: DeviceRegistry>(
    State(state): State<AppState<E, R>>,
    Json(body): Json<CompleteBody>,
) -> Result<Response, ApiError> {
    let request = completion_request(&state, &body)?;
    let id = completion_id();

    if !body.stream {
        let raw = state.session.complete(request).await?;
        let result = CompletionResponse::parse(&raw)?;
        info!("Completion {} finished ({} tokens)", id, result.total_tokens);
        return Ok(Json(CompletionBody { id, result }).into_response());
    }

    let (sink, mut tokens) = token_channel();
    let running = Arc::new(AtomicBool::new(false));
    let pending = state
        .session
        .complete(request.sink(tracked_sink(sink, running.clone())));
    let guard = StopOnDisconnect {
        session: state.session.clone(),
        running,
    };
    info!("Streaming completion {}", id);

    let stream = async_stream::stream! {
        while let Some(token) = tokens.next().await {
            let chunk = TokenChunk { id: &id, token: token.token, token_id: token.token_id };
            yield Ok::<_, std::convert::Infallible>(sse_event("token", &chunk));
        }

        let outcome = pending.await;
        drop(guard);

        match outcome.and_then(|raw| CompletionResponse::parse(&raw)) {
            Ok(result) => {
                yield Ok(sse_event("done", &CompletionBody { id: id.clone(), result }));
            }
            Err(err) => {
                warn!("Completion {} failed: {}", id, err);
                yield Ok(sse_event("error", &StreamError { id: &id, error: err.to_string() }));
            }
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Transcribe an audio file
pub async fn transcribe<E: Engine, R: DeviceRegistry>(
    State(state): State<AppState<E, R>>,
    Json(body): Json<TranscribeBody>,
) -> Result<Json<CompletionBody>, ApiError> {
    let options = body.options.unwrap_or_default();
    let request = TranscriptionRequest::new(body.audio_path, body.prompt)
        .buffer_size(options.buffer_size(state.config.default_max_tokens))
        .options(options.to_json()?);

    let raw = state.session.transcribe(request).await?;
    let result = CompletionResponse::parse(&raw)?;
    Ok(Json(CompletionBody {
        id: completion_id(),
        result,
    }))
}

/// Embed text, an image file or an audio file
pub async fn embeddings<E: Engine, R: DeviceRegistry>(
    State(state): State<AppState<E, R>>,
    Json(body): Json<EmbeddingsBody>,
) -> Result<Json<EmbeddingsResponse>, ApiError> {
    let buffer_size = body
        .buffer_size
        .unwrap_or(state.config.embedding_buffer_size);
    let request = EmbeddingRequest::new(body.kind, body.input).buffer_size(buffer_size);

    let embedding = state.session.embedding(request).await?;
    debug!("{} embedding with {} dimensions", body.kind, embedding.len());

    Ok(Json(EmbeddingsResponse {
        dimension: embedding.len(),
        embedding,
        kind: body.kind,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("not representable"))
        }
    }

    #[test]
    fn frame_carries_payload_json() {
        let chunk = TokenChunk {
            id: "cmpl-1",
            token: "Hi".to_string(),
            token_id: 5,
        };
        let (name, data) = sse_frame("token", &chunk);
        assert_eq!(name, "token");
        assert_eq!(data, r#"{"id":"cmpl-1","token":"Hi","token_id":5}"#);
    }

    #[test]
    fn unserializable_payload_becomes_error_frame() {
        let (name, data) = sse_frame("done", &Unserializable);
        assert_eq!(name, "error");

        let body: serde_json::Value = serde_json::from_str(&data).unwrap();
        let message = body["error"].as_str().unwrap();
        assert!(message.contains("done"));
        assert!(message.contains("not representable"));
    }

    #[test]
    fn flag_tracks_the_sink_lifetime() {
        let running = Arc::new(AtomicBool::new(false));
        let mut sink = tracked_sink(Box::new(|_: &str, _: u32| {}), running.clone());
        assert!(!running.load(Ordering::SeqCst));

        sink("a", 1);
        assert!(running.load(Ordering::SeqCst));

        drop(sink);
        assert!(!running.load(Ordering::SeqCst));
    }
}
