//! Session lifecycle around a single engine handle.
//!
//! A session is either empty or holds exactly one loaded model. `init` and
//! `destroy` move between the two states; every other operation needs a
//! loaded model and fails with [`Error::NotInitialized`] otherwise. `stop` is
//! the exception: it is forwarded to the engine in any state and never waits
//! for the session lock, so it can reach a generation that is holding it.
//!
//! All operations run on the blocking pool through [`Dispatcher`] and hold
//! the session lock for the whole engine call, including token delivery.
//! A request's token sink is dropped before the lock is released.

use std::ffi::CString;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};

use crate::buffer::{TextBuffer, VectorBuffer};
use crate::dispatch::{Dispatcher, Pending};
use crate::engine::{EmbeddingKind, Engine};
use crate::error::{Error, Result};
use crate::params::strip_file_scheme;
use crate::request::{CompletionRequest, EmbeddingRequest, TranscriptionRequest};
use crate::stream::TokenBridge;

/// Everything guarded by the session lock.
struct SessionState<H> {
    handle: Option<H>,
    context_size: usize,
}

impl<H> SessionState<H> {
    fn handle_mut(&mut self) -> Result<&mut H> {
        self.handle.as_mut().ok_or(Error::NotInitialized)
    }
}

struct Shared<E: Engine> {
    engine: E,
    state: Mutex<SessionState<E::Handle>>,
    /// Written only by `init`/`destroy` while they hold `state`.
    stop_target: Mutex<Option<E::StopTarget>>,
    /// Mirrors `state.handle.is_some()` for readers that must not wait.
    loaded: AtomicBool,
}

impl<E: Engine> Shared<E> {
    /// Run `f` with exclusive access to the session state.
    ///
    /// The guard is released on every exit path. A panic inside an earlier
    /// operation leaves the lock poisoned; the state is still consistent
    /// because each transition is a single assignment, so it is recovered.
    fn exclusive<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut SessionState<E::Handle>) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| {
            warn!(operation, "session lock poisoned, recovering");
            poisoned.into_inner()
        });
        debug!(operation, "entered session");
        f(&mut state)
    }

    fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::SeqCst);
    }

    fn set_stop_target(&self, target: Option<E::StopTarget>) {
        *self
            .stop_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = target;
    }

    fn signal_stop(&self) {
        let target = self
            .stop_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if target.is_none() {
            debug!("forwarding stop with no model loaded");
        }
        self.engine.stop(target.as_ref());
    }
}

impl<E: Engine> Drop for Shared<E> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = state.handle.take() else {
            return;
        };
        info!("session dropped with a model still loaded, releasing it");
        *self
            .stop_target
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner) = None;
        *self.loaded.get_mut() = false;

        // The last clone often goes away inside an async task. Tell a
        // multi-threaded runtime that this worker is about to block.
        let on_multi_thread = Handle::try_current()
            .map(|runtime| runtime.runtime_flavor() == RuntimeFlavor::MultiThread)
            .unwrap_or(false);
        if on_multi_thread {
            tokio::task::block_in_place(|| self.engine.destroy(handle));
        } else {
            self.engine.destroy(handle);
        }
    }
}

/// Async, concurrency-safe front for one engine handle.
///
/// Cloning a session shares the same handle. The handle is released by
/// [`Session::destroy`] or, failing that, when the last clone and the last
/// in-flight operation are gone.
pub struct Session<E: Engine> {
    shared: Arc<Shared<E>>,
    dispatcher: Dispatcher,
}

impl<E: Engine> Clone for Session<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<E: Engine> fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

fn c_string(what: &str, value: &str) -> Result<CString> {
    CString::new(value).map_err(|e| {
        Error::InvalidArgument(format!(
            "{} contains a NUL byte at offset {}",
            what,
            e.nul_position()
        ))
    })
}

fn c_string_opt(what: &str, value: Option<&str>) -> Result<Option<CString>> {
    value.map(|v| c_string(what, v)).transpose()
}

impl<E: Engine> Session<E> {
    /// Create an empty session dispatching on the current tokio runtime.
    pub fn new(engine: E) -> Result<Self> {
        Ok(Self::with_dispatcher(engine, Dispatcher::current()?))
    }

    pub fn with_dispatcher(engine: E, dispatcher: Dispatcher) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                state: Mutex::new(SessionState {
                    handle: None,
                    context_size: 0,
                }),
                stop_target: Mutex::new(None),
                loaded: AtomicBool::new(false),
            }),
            dispatcher,
        }
    }

    /// The engine this session drives.
    pub fn engine(&self) -> &E {
        &self.shared.engine
    }

    /// Load a model.
    pub fn init(
        &self,
        model_path: &str,
        context_size: usize,
        corpus_dir: Option<&str>,
    ) -> Pending<()> {
        let shared = self.shared.clone();
        let model_path = model_path.to_string();
        let corpus_dir = corpus_dir.map(str::to_string);

        self.dispatcher.dispatch("init", move || {
            let path = c_string("model path", &model_path)?;
            let corpus = c_string_opt("corpus dir", corpus_dir.as_deref())?;

            shared.exclusive("init", |state| {
                if state.handle.is_some() {
                    return Err(Error::AlreadyInitialized);
                }

                let handle = shared
                    .engine
                    .init(&path, context_size, corpus.as_deref())
                    .ok_or_else(|| Error::InitializationFailed(model_path.clone()))?;

                shared.set_stop_target(Some(shared.engine.stop_target(&handle)));
                state.handle = Some(handle);
                shared.set_loaded(true);
                state.context_size = context_size;

                info!(model = %model_path, context_size, "model initialized");
                Ok(())
            })
        })
    }

    /// Run a chat completion and return the engine's raw response text.
    pub fn complete(&self, request: CompletionRequest) -> Pending<String> {
        let shared = self.shared.clone();

        self.dispatcher.dispatch("complete", move || {
            let CompletionRequest {
                messages_json,
                buffer_size,
                options_json,
                tools_json,
                sink,
            } = request;

            let messages = c_string("messages", &messages_json)?;
            let options = c_string_opt("options", options_json.as_deref())?;
            let tools = c_string_opt("tools", tools_json.as_deref())?;

            shared.exclusive("complete", |state| {
                let mut sink = sink;
                let handle = state.handle_mut()?;
                let mut buffer = TextBuffer::with_capacity(buffer_size)?;
                let mut bridge = TokenBridge::new(sink.as_mut());

                let status = shared.engine.complete(
                    handle,
                    &messages,
                    buffer.as_mut_slice(),
                    options.as_deref(),
                    tools.as_deref(),
                    &mut bridge,
                );

                if status < 0 {
                    warn!(status, delivered = bridge.delivered(), "completion failed");
                    return Err(Error::CompletionFailed { status });
                }

                debug!(status, delivered = bridge.delivered(), "completion finished");
                Ok(buffer.into_text())
            })
        })
    }

    /// Transcribe an audio file and return the engine's raw response text.
    pub fn transcribe(&self, request: TranscriptionRequest) -> Pending<String> {
        let shared = self.shared.clone();

        self.dispatcher.dispatch("transcribe", move || {
            let TranscriptionRequest {
                audio_path,
                prompt,
                buffer_size,
                options_json,
                sink,
            } = request;

            let audio = c_string("audio path", strip_file_scheme(&audio_path))?;
            let prompt = c_string("prompt", &prompt)?;
            let options = c_string_opt("options", options_json.as_deref())?;

            shared.exclusive("transcribe", |state| {
                let mut sink = sink;
                let handle = state.handle_mut()?;
                let mut buffer = TextBuffer::with_capacity(buffer_size)?;
                let mut bridge = TokenBridge::new(sink.as_mut());

                let status = shared.engine.transcribe(
                    handle,
                    &audio,
                    &prompt,
                    buffer.as_mut_slice(),
                    options.as_deref(),
                    &mut bridge,
                );

                if status < 0 {
                    warn!(status, delivered = bridge.delivered(), "transcription failed");
                    return Err(Error::TranscriptionFailed { status });
                }

                Ok(buffer.into_text())
            })
        })
    }

    /// Embed text.
    pub fn embed(&self, text: &str, buffer_size: usize) -> Pending<Vec<f64>> {
        self.embedding(EmbeddingRequest::new(EmbeddingKind::Text, text).buffer_size(buffer_size))
    }

    /// Embed an image file.
    pub fn image_embed(&self, image_path: &str, buffer_size: usize) -> Pending<Vec<f64>> {
        self.embedding(
            EmbeddingRequest::new(EmbeddingKind::Image, image_path).buffer_size(buffer_size),
        )
    }

    /// Embed an audio file.
    pub fn audio_embed(&self, audio_path: &str, buffer_size: usize) -> Pending<Vec<f64>> {
        self.embedding(
            EmbeddingRequest::new(EmbeddingKind::Audio, audio_path).buffer_size(buffer_size),
        )
    }

    pub fn embedding(&self, request: EmbeddingRequest) -> Pending<Vec<f64>> {
        let shared = self.shared.clone();
        let operation = match request.kind {
            EmbeddingKind::Text => "embed",
            EmbeddingKind::Image => "image_embed",
            EmbeddingKind::Audio => "audio_embed",
        };

        self.dispatcher.dispatch(operation, move || {
            let EmbeddingRequest {
                kind,
                input,
                buffer_size,
            } = request;

            let input = match kind {
                EmbeddingKind::Text => c_string("text", &input)?,
                EmbeddingKind::Image | EmbeddingKind::Audio => {
                    c_string("input path", strip_file_scheme(&input))?
                }
            };

            shared.exclusive(operation, |state| {
                let handle = state.handle_mut()?;
                let mut buffer = VectorBuffer::with_capacity(buffer_size)?;
                let mut dimension = 0usize;

                let status = shared.engine.embed(
                    handle,
                    kind,
                    &input,
                    buffer.as_mut_slice(),
                    &mut dimension,
                );

                if status < 0 {
                    warn!(status, %kind, "embedding failed");
                    return Err(Error::EmbeddingFailed { kind, status });
                }

                Ok(buffer.into_embedding(dimension))
            })
        })
    }

    /// Clear the engine's conversation state, keeping the model loaded.
    pub fn reset(&self) -> Pending<()> {
        let shared = self.shared.clone();
        self.dispatcher.dispatch("reset", move || {
            shared.exclusive("reset", |state| {
                let handle = state.handle_mut()?;
                shared.engine.reset(handle);
                debug!("session reset");
                Ok(())
            })
        })
    }

    /// Ask the engine to abort the generation in flight.
    ///
    /// Never takes the session lock and never checks whether a model is
    /// loaded; the engine decides what stopping means in either case.
    pub fn stop(&self) -> Pending<()> {
        let shared = self.shared.clone();
        self.dispatcher.dispatch("stop", move || {
            shared.signal_stop();
            Ok(())
        })
    }

    /// Release the loaded model. Fails if none is loaded.
    pub fn destroy(&self) -> Pending<()> {
        let shared = self.shared.clone();
        self.dispatcher.dispatch("destroy", move || {
            shared.exclusive("destroy", |state| {
                let handle = state.handle.take().ok_or(Error::NotInitialized)?;
                // Waits out a stop that is being forwarded right now.
                shared.set_stop_target(None);
                shared.set_loaded(false);
                shared.engine.destroy(handle);
                info!("model destroyed");
                Ok(())
            })
        })
    }

    /// Whether a model is loaded, answered without waiting for the session
    /// lock.
    ///
    /// `init` and `destroy` update it while they hold the lock, so it never
    /// reports a handle that has already been released. Use
    /// [`Session::is_initialized`] when the answer must be ordered with other
    /// operations.
    pub fn is_loaded(&self) -> bool {
        self.shared.loaded.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> Pending<bool> {
        let shared = self.shared.clone();
        self.dispatcher.dispatch("is_initialized", move || {
            shared.exclusive("is_initialized", |state| Ok(state.handle.is_some()))
        })
    }

    /// Context size of the loaded model, `None` when empty.
    pub fn context_size(&self) -> Pending<Option<usize>> {
        let shared = self.shared.clone();
        self.dispatcher.dispatch("context_size", move || {
            shared.exclusive("context_size", |state| {
                Ok(state.handle.as_ref().map(|_| state.context_size))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn session() -> Session<ScriptedEngine> {
        Session::new(ScriptedEngine::new()).unwrap()
    }

    async fn loaded() -> Session<ScriptedEngine> {
        let session = session();
        assert_ok!(session.init("/models/qwen3-0.6", 2048, None).await);
        session
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn init_destroy_init_reuses_the_slot() {
        let session = session();
        assert_ok!(session.init("/models/a", 1024, None).await);
        assert_ok!(session.destroy().await);
        assert_ok!(session.init("/models/b", 4096, Some("/corpus")).await);

        assert_eq!(session.context_size().await.unwrap(), Some(4096));
        assert_eq!(session.engine().inits(), 2);
        assert_eq!(session.engine().destroys(), 1);
        assert_eq!(
            session.engine().last_corpus_dir().as_deref(),
            Some("/corpus")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_init_fails_and_keeps_context_size() {
        let session = session();
        assert_ok!(session.init("/models/a", 1024, None).await);

        let err = assert_err!(session.init("/models/a", 4096, None).await);
        assert!(matches!(err, Error::AlreadyInitialized));
        assert_eq!(session.context_size().await.unwrap(), Some(1024));
        assert_eq!(session.engine().inits(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_engine_init_leaves_session_empty() {
        let session = session();
        session.engine().fail_init(true);

        let err = assert_err!(session.init("/models/missing", 2048, None).await);
        assert!(matches!(err, Error::InitializationFailed(path) if path == "/models/missing"));
        assert!(!session.is_initialized().await.unwrap());

        session.engine().fail_init(false);
        assert_ok!(session.init("/models/present", 2048, None).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn operations_without_model_are_rejected() {
        let session = session();

        let results = vec![
            session
                .complete(CompletionRequest::new("[]"))
                .await
                .map(|_| ()),
            session
                .transcribe(TranscriptionRequest::new("/a.wav", ""))
                .await
                .map(|_| ()),
            session.embed("hi", 16).await.map(|_| ()),
            session.image_embed("/a.png", 16).await.map(|_| ()),
            session.audio_embed("/a.wav", 16).await.map(|_| ()),
            session.reset().await,
            session.destroy().await,
        ];

        for result in results {
            assert!(matches!(result, Err(Error::NotInitialized)));
        }
        assert_eq!(session.engine().calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn destroy_is_not_idempotent() {
        let session = loaded().await;
        assert_ok!(session.destroy().await);
        let err = assert_err!(session.destroy().await);
        assert!(matches!(err, Error::NotInitialized));
        assert_eq!(session.engine().destroys(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completion_text_has_no_padding() {
        let session = loaded().await;
        for len in 0..64 {
            let reply = "y".repeat(len);
            session.engine().set_reply(&reply);
            let text = session
                .complete(CompletionRequest::new("[]").buffer_size(64))
                .await
                .unwrap();
            assert_eq!(text.len(), len);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn engine_rejecting_small_buffer_is_a_completion_failure() {
        let session = loaded().await;
        session.engine().set_reply("this reply is longer than eight bytes");
        let err = assert_err!(
            session
                .complete(CompletionRequest::new("[]").buffer_size(8))
                .await
        );
        assert!(matches!(err, Error::CompletionFailed { status } if status < 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tokens_arrive_in_emission_order() {
        let session = loaded().await;
        session
            .engine()
            .set_tokens(&[("The", 1), ("cat", 2), ("sat", 3)]);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let record = seen.clone();
        let text = session
            .complete(CompletionRequest::new("[]").on_token(move |token, id| {
                record.lock().unwrap().push((token.to_string(), id));
            }))
            .await
            .unwrap();

        assert_eq!(text, "Thecatsat");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("The".to_string(), 1),
                ("cat".to_string(), 2),
                ("sat".to_string(), 3)
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tokens_are_delivered_on_the_worker_thread() {
        let session = loaded().await;
        session.engine().set_tokens(&[("a", 1), ("b", 2)]);
        let caller = std::thread::current().id();

        let threads = Arc::new(StdMutex::new(Vec::new()));
        let record = threads.clone();
        session
            .complete(CompletionRequest::new("[]").on_token(move |_, _| {
                record.lock().unwrap().push(std::thread::current().id());
            }))
            .await
            .unwrap();

        let threads = threads.lock().unwrap();
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|id| *id != caller));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failure_after_tokens_keeps_tokens_and_rejects() {
        let session = loaded().await;
        session.engine().set_tokens(&[("partial", 9)]);
        session.engine().fail_calls_with(-3);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let record = seen.clone();
        let err = assert_err!(
            session
                .complete(CompletionRequest::new("[]").on_token(move |token, _| {
                    record.lock().unwrap().push(token.to_string());
                }))
                .await
        );

        assert!(matches!(err, Error::CompletionFailed { status: -3 }));
        assert_eq!(*seen.lock().unwrap(), vec!["partial".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn token_stream_follows_a_running_completion() {
        use crate::stream::token_channel;
        use tokio_stream::StreamExt;

        let session = loaded().await;
        session.engine().set_tokens(&[("one", 1), ("two", 2)]);

        let (sink, stream) = token_channel();
        let pending = session.complete(CompletionRequest::new("[]").sink(sink));

        let events: Vec<(String, u32)> = stream.map(|e| (e.token, e.token_id)).collect().await;
        assert_eq!(events, vec![("one".to_string(), 1), ("two".to_string(), 2)]);
        assert_eq!(pending.await.unwrap(), "onetwo");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completion_without_sink_still_runs() {
        let session = loaded().await;
        session.engine().set_tokens(&[("ok", 1)]);
        let text = session.complete(CompletionRequest::new("[]")).await.unwrap();
        assert_eq!(text, "ok");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn options_and_tools_pass_through() {
        let session = loaded().await;
        session
            .complete(
                CompletionRequest::new(r#"[{"role":"user","content":"hi"}]"#)
                    .options(r#"{"max_tokens":16}"#)
                    .tools("[]"),
            )
            .await
            .unwrap();

        let seen = session.engine().last_complete().unwrap();
        assert_eq!(seen.messages_json, r#"[{"role":"user","content":"hi"}]"#);
        assert_eq!(seen.options_json.as_deref(), Some(r#"{"max_tokens":16}"#));
        assert_eq!(seen.tools_json.as_deref(), Some("[]"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interior_nul_is_an_invalid_argument() {
        let session = loaded().await;
        let err = assert_err!(session.complete(CompletionRequest::new("a\0b")).await);
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transcription_strips_file_scheme_and_streams() {
        let session = loaded().await;
        session.engine().set_tokens(&[("hello", 11), (" world", 12)]);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let record = seen.clone();
        let text = session
            .transcribe(
                TranscriptionRequest::new("file:///tmp/clip.wav", "transcribe:").on_token(
                    move |token, id| record.lock().unwrap().push((token.to_string(), id)),
                ),
            )
            .await
            .unwrap();

        assert_eq!(text, "hello world");
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(
            session.engine().last_input().as_deref(),
            Some("/tmp/clip.wav")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transcription_failure_maps_to_its_own_error() {
        let session = loaded().await;
        session.engine().fail_calls_with(-1);
        let err = assert_err!(
            session
                .transcribe(TranscriptionRequest::new("/a.wav", ""))
                .await
        );
        assert!(matches!(err, Error::TranscriptionFailed { status: -1 }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn embedding_is_truncated_to_reported_dimension() {
        let session = loaded().await;
        session.engine().set_embedding_dim(32);

        let embedding = session.embed("hello", 128).await.unwrap();
        assert_eq!(embedding.len(), 32);
        assert_eq!(session.engine().last_embed_capacity(), Some(128));

        let image = session.image_embed("file:///tmp/cat.png", 128).await.unwrap();
        assert_eq!(image.len(), 32);
        assert_eq!(session.engine().last_input().as_deref(), Some("/tmp/cat.png"));

        let audio = session.audio_embed("/tmp/clip.wav", 128).await.unwrap();
        assert_eq!(audio.len(), 32);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn embedding_failure_names_the_kind() {
        let session = loaded().await;
        session.engine().fail_calls_with(-2);
        let err = assert_err!(session.image_embed("/a.png", 16).await);
        assert!(matches!(
            err,
            Error::EmbeddingFailed {
                kind: EmbeddingKind::Image,
                status: -2
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reset_keeps_the_model_loaded() {
        let session = loaded().await;
        assert_ok!(session.reset().await);
        assert_eq!(session.engine().resets(), 1);
        assert!(session.is_initialized().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_completions_never_overlap() {
        let session = loaded().await;
        session.engine().set_tokens(&[("a", 1), ("b", 2), ("c", 3)]);
        session.engine().set_token_delay(Duration::from_millis(5));

        let pending: Vec<_> = (0..8)
            .map(|_| session.complete(CompletionRequest::new("[]")))
            .collect();
        for result in futures::future::join_all(pending).await {
            assert_eq!(result.unwrap(), "abc");
        }

        assert_eq!(session.engine().max_in_section(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_reaches_a_running_generation() {
        let session = loaded().await;
        let tokens: Vec<(String, u32)> = (0..200).map(|i| (format!("t{i} "), i)).collect();
        session.engine().set_owned_tokens(tokens);
        session.engine().set_token_delay(Duration::from_millis(10));

        let (first_tx, first_rx) = tokio::sync::oneshot::channel();
        let mut first_tx = Some(first_tx);
        let running = session.complete(CompletionRequest::new("[]").on_token(move |_, _| {
            if let Some(tx) = first_tx.take() {
                let _ = tx.send(());
            }
        }));

        first_rx.await.unwrap();
        // The completion holds the session lock; stop must not wait for it.
        assert_ok!(session.stop().await);

        let err = assert_err!(running.await);
        assert!(matches!(err, Error::CompletionFailed { .. }));
        assert_eq!(session.engine().stops(), 1);
        assert_eq!(session.engine().stops_without_model(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_without_model_is_still_forwarded() {
        let session = session();
        assert_ok!(session.stop().await);
        assert_eq!(session.engine().stops(), 1);
        assert_eq!(session.engine().stops_without_model(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_the_session_releases_the_model() {
        let engine = ScriptedEngine::new();
        let probe = engine.probe();
        let session = Session::new(engine).unwrap();
        assert_ok!(session.init("/models/a", 2048, None).await);

        drop(session);
        assert_eq!(probe.destroys(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_after_destroy_does_not_destroy_twice() {
        let engine = ScriptedEngine::new();
        let probe = engine.probe();
        let session = Session::new(engine).unwrap();
        assert_ok!(session.init("/models/a", 2048, None).await);
        assert_ok!(session.destroy().await);

        drop(session);
        assert_eq!(probe.destroys(), 1);
    }

    #[tokio::test]
    async fn dropping_on_a_current_thread_runtime_releases_the_model() {
        let engine = ScriptedEngine::new();
        let probe = engine.probe();
        let session = Session::new(engine).unwrap();
        assert_ok!(session.init("/models/a", 2048, None).await);

        drop(session);
        assert_eq!(probe.destroys(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn loaded_flag_does_not_wait_for_a_running_generation() {
        let session = session();
        assert!(!session.is_loaded());
        assert_ok!(session.init("/models/a", 2048, None).await);
        assert!(session.is_loaded());

        let tokens: Vec<(String, u32)> = (0..200).map(|i| (format!("t{i} "), i)).collect();
        session.engine().set_owned_tokens(tokens);
        session.engine().set_token_delay(Duration::from_millis(10));

        let (first_tx, first_rx) = tokio::sync::oneshot::channel();
        let mut first_tx = Some(first_tx);
        let running = session.complete(CompletionRequest::new("[]").on_token(move |_, _| {
            if let Some(tx) = first_tx.take() {
                let _ = tx.send(());
            }
        }));
        first_rx.await.unwrap();

        // The locked query queues behind the generation, the flag does not.
        let queued = tokio::time::timeout(Duration::from_millis(50), session.is_initialized());
        assert!(queued.await.is_err());
        assert!(session.is_loaded());

        assert_ok!(session.stop().await);
        assert_err!(running.await);
        assert_ok!(session.destroy().await);
        assert!(!session.is_loaded());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_sink_is_detached_and_the_call_completes() {
        let session = loaded().await;
        session.engine().set_tokens(&[("boom", 1), ("fine", 2)]);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let record = seen.clone();
        let reply = session
            .complete(CompletionRequest::new("[]").on_token(move |token, _| {
                record.lock().unwrap().push(token.to_string());
                if token == "boom" {
                    panic!("sink failure");
                }
            }))
            .await
            .unwrap();

        assert_eq!(reply, "boomfine");
        assert_eq!(*seen.lock().unwrap(), vec!["boom".to_string()]);

        // The lock was released normally; the model is still usable.
        session.engine().set_tokens(&[("again", 3)]);
        assert_eq!(
            session.complete(CompletionRequest::new("[]")).await.unwrap(),
            "again"
        );
        assert_eq!(session.engine().max_in_section(), 1);
    }
}
