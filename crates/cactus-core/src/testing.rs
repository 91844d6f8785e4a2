//! In-process stand-ins for the native engine and registry.
//!
//! [`ScriptedEngine`] replays a configured token sequence, records what it
//! was called with and counts how many callers are inside it at once.
//! [`ScriptedRegistry`] hands out heap strings and counts every allocation
//! and free, so leaks on the registration path are observable.
//!
//! Both are cheap to clone; clones share the same script and counters, so a
//! test can keep one as a probe after moving the other into a session.

use std::ffi::{c_char, CStr, CString};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::engine::{DeviceRegistry, EmbeddingKind, Engine, Status};
use crate::stream::TokenBridge;

/// Status returned when generation is aborted by `stop`.
pub const STATUS_STOPPED: Status = -4;

/// Status returned when the reply does not fit the output buffer.
pub const STATUS_BUFFER_TOO_SMALL: Status = -5;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Arguments of the most recent `complete` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteCall {
    pub messages_json: String,
    pub options_json: Option<String>,
    pub tools_json: Option<String>,
}

#[derive(Default)]
struct Script {
    tokens: Mutex<Vec<(String, u32)>>,
    reply: Mutex<Option<String>>,
    token_delay: Mutex<Duration>,
    fail_status: AtomicI32,
    fail_init: AtomicBool,
    embedding_dim: AtomicUsize,

    next_handle: AtomicU64,
    inits: AtomicUsize,
    destroys: AtomicUsize,
    resets: AtomicUsize,
    stops: AtomicUsize,
    stops_without_model: AtomicUsize,
    calls: AtomicUsize,
    in_section: AtomicUsize,
    max_in_section: AtomicUsize,

    last_complete: Mutex<Option<CompleteCall>>,
    last_input: Mutex<Option<String>>,
    last_corpus_dir: Mutex<Option<String>>,
    last_embed_capacity: Mutex<Option<usize>>,
}

/// Loaded scripted model.
#[derive(Debug)]
pub struct ScriptedHandle {
    id: u64,
    context_size: usize,
    stopped: Arc<AtomicBool>,
}

impl ScriptedHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }
}

struct SectionGuard<'a>(&'a AtomicUsize);

impl Drop for SectionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Deterministic [`Engine`] driven by a script.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Script>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        let engine = Self::default();
        engine.set_embedding_dim(8);
        engine
    }

    /// Another view on the same script and counters.
    pub fn probe(&self) -> Self {
        self.clone()
    }

    pub fn set_tokens(&self, tokens: &[(&str, u32)]) {
        self.set_owned_tokens(
            tokens
                .iter()
                .map(|(text, id)| (text.to_string(), *id))
                .collect(),
        );
    }

    pub fn set_owned_tokens(&self, tokens: Vec<(String, u32)>) {
        *lock(&self.script.tokens) = tokens;
        *lock(&self.script.reply) = None;
    }

    /// Reply text written to the buffer. Defaults to the concatenated tokens.
    pub fn set_reply(&self, reply: &str) {
        *lock(&self.script.reply) = Some(reply.to_string());
    }

    pub fn set_token_delay(&self, delay: Duration) {
        *lock(&self.script.token_delay) = delay;
    }

    /// Make every generation and embedding call return `status` after
    /// emitting its tokens. Zero clears the failure.
    pub fn fail_calls_with(&self, status: Status) {
        self.script.fail_status.store(status, Ordering::SeqCst);
    }

    pub fn fail_init(&self, fail: bool) {
        self.script.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn set_embedding_dim(&self, dim: usize) {
        self.script.embedding_dim.store(dim, Ordering::SeqCst);
    }

    pub fn inits(&self) -> usize {
        self.script.inits.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.script.destroys.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.script.resets.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.script.stops.load(Ordering::SeqCst)
    }

    pub fn stops_without_model(&self) -> usize {
        self.script.stops_without_model.load(Ordering::SeqCst)
    }

    /// Calls that needed a loaded model (generation, embedding, reset).
    pub fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }

    /// Highest number of callers observed inside the engine at once.
    pub fn max_in_section(&self) -> usize {
        self.script.max_in_section.load(Ordering::SeqCst)
    }

    pub fn last_complete(&self) -> Option<CompleteCall> {
        lock(&self.script.last_complete).clone()
    }

    /// Last audio/image path or embedding text seen.
    pub fn last_input(&self) -> Option<String> {
        lock(&self.script.last_input).clone()
    }

    pub fn last_corpus_dir(&self) -> Option<String> {
        lock(&self.script.last_corpus_dir).clone()
    }

    /// Capacity (elements) of the last embedding buffer.
    pub fn last_embed_capacity(&self) -> Option<usize> {
        *lock(&self.script.last_embed_capacity)
    }

    fn enter(&self) -> SectionGuard<'_> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.script.in_section.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.max_in_section.fetch_max(now, Ordering::SeqCst);
        SectionGuard(&self.script.in_section)
    }

    fn generate(&self, handle: &ScriptedHandle, out: &mut [u8], hook: &mut TokenBridge<'_>) -> Status {
        let _section = self.enter();
        handle.stopped.store(false, Ordering::SeqCst);

        let tokens = lock(&self.script.tokens).clone();
        let delay = *lock(&self.script.token_delay);

        for (token, id) in &tokens {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            if handle.stopped.load(Ordering::SeqCst) {
                return STATUS_STOPPED;
            }
            hook.emit(token, *id);
        }

        let status = self.script.fail_status.load(Ordering::SeqCst);
        if status < 0 {
            return status;
        }

        let reply = lock(&self.script.reply)
            .clone()
            .unwrap_or_else(|| tokens.iter().map(|(t, _)| t.as_str()).collect());
        if reply.len() >= out.len() {
            return STATUS_BUFFER_TOO_SMALL;
        }
        out[..reply.len()].copy_from_slice(reply.as_bytes());
        out[reply.len()] = 0;
        Status::try_from(reply.len()).unwrap_or(Status::MAX)
    }
}

impl Engine for ScriptedEngine {
    type Handle = ScriptedHandle;
    type StopTarget = Arc<AtomicBool>;

    fn init(
        &self,
        _model_path: &CStr,
        context_size: usize,
        corpus_dir: Option<&CStr>,
    ) -> Option<ScriptedHandle> {
        if self.script.fail_init.load(Ordering::SeqCst) {
            return None;
        }
        self.script.inits.fetch_add(1, Ordering::SeqCst);
        *lock(&self.script.last_corpus_dir) =
            corpus_dir.map(|dir| dir.to_string_lossy().into_owned());
        Some(ScriptedHandle {
            id: self.script.next_handle.fetch_add(1, Ordering::SeqCst),
            context_size,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    fn stop_target(&self, handle: &ScriptedHandle) -> Arc<AtomicBool> {
        handle.stopped.clone()
    }

    fn complete(
        &self,
        handle: &mut ScriptedHandle,
        messages_json: &CStr,
        out: &mut [u8],
        options_json: Option<&CStr>,
        tools_json: Option<&CStr>,
        hook: &mut TokenBridge<'_>,
    ) -> Status {
        let text = |s: &CStr| s.to_string_lossy().into_owned();
        *lock(&self.script.last_complete) = Some(CompleteCall {
            messages_json: text(messages_json),
            options_json: options_json.map(text),
            tools_json: tools_json.map(text),
        });
        self.generate(handle, out, hook)
    }

    fn transcribe(
        &self,
        handle: &mut ScriptedHandle,
        audio_path: &CStr,
        _prompt: &CStr,
        out: &mut [u8],
        _options_json: Option<&CStr>,
        hook: &mut TokenBridge<'_>,
    ) -> Status {
        *lock(&self.script.last_input) = Some(audio_path.to_string_lossy().into_owned());
        self.generate(handle, out, hook)
    }

    fn embed(
        &self,
        _handle: &mut ScriptedHandle,
        kind: EmbeddingKind,
        input: &CStr,
        out: &mut [f32],
        dimension: &mut usize,
    ) -> Status {
        let _section = self.enter();
        *lock(&self.script.last_input) = Some(input.to_string_lossy().into_owned());
        *lock(&self.script.last_embed_capacity) = Some(out.len());

        let status = self.script.fail_status.load(Ordering::SeqCst);
        if status < 0 {
            return status;
        }

        let dim = self.script.embedding_dim.load(Ordering::SeqCst);
        if dim > out.len() {
            return STATUS_BUFFER_TOO_SMALL;
        }
        let offset = match kind {
            EmbeddingKind::Text => 0.0,
            EmbeddingKind::Image => 1.0,
            EmbeddingKind::Audio => 2.0,
        };
        for (i, value) in out.iter_mut().take(dim).enumerate() {
            *value = offset + i as f32 * 0.25;
        }
        *dimension = dim;
        0
    }

    fn reset(&self, _handle: &mut ScriptedHandle) {
        let _section = self.enter();
        self.script.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self, target: Option<&Arc<AtomicBool>>) {
        self.script.stops.fetch_add(1, Ordering::SeqCst);
        match target {
            Some(flag) => flag.store(true, Ordering::SeqCst),
            None => {
                self.script.stops_without_model.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn destroy(&self, _handle: ScriptedHandle) {
        self.script.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RegistryScript {
    registration: Mutex<Option<String>>,
    device_id: Mutex<Option<String>>,
    payloads: Mutex<Vec<String>>,
    data_directories: Mutex<Vec<String>>,
    allocations: AtomicUsize,
    frees: AtomicUsize,
}

/// [`DeviceRegistry`] with an instrumented allocator.
#[derive(Clone, Default)]
pub struct ScriptedRegistry {
    script: Arc<RegistryScript>,
}

impl ScriptedRegistry {
    /// A registry that rejects every payload and has no device id.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> Self {
        self.clone()
    }

    /// Accept registrations, answering with `response`.
    pub fn accept_registration(&self, response: &str) {
        *lock(&self.script.registration) = Some(response.to_string());
    }

    pub fn reject_registration(&self) {
        *lock(&self.script.registration) = None;
    }

    pub fn set_device_id(&self, device_id: Option<&str>) {
        *lock(&self.script.device_id) = device_id.map(str::to_string);
    }

    pub fn allocations(&self) -> usize {
        self.script.allocations.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.script.frees.load(Ordering::SeqCst)
    }

    /// Strings handed out and not yet released.
    pub fn live_allocations(&self) -> usize {
        self.allocations().saturating_sub(self.frees())
    }

    pub fn payloads(&self) -> Vec<String> {
        lock(&self.script.payloads).clone()
    }

    pub fn data_directories(&self) -> Vec<String> {
        lock(&self.script.data_directories).clone()
    }
}

impl DeviceRegistry for ScriptedRegistry {
    fn register_app(&self, encrypted_payload: &CStr) -> Option<NonNull<c_char>> {
        lock(&self.script.payloads).push(encrypted_payload.to_string_lossy().into_owned());

        let response = lock(&self.script.registration).clone()?;
        let owned = CString::new(response).ok()?;
        self.script.allocations.fetch_add(1, Ordering::SeqCst);
        NonNull::new(owned.into_raw())
    }

    unsafe fn free_string(&self, ptr: NonNull<c_char>) {
        drop(CString::from_raw(ptr.as_ptr()));
        self.script.frees.fetch_add(1, Ordering::SeqCst);
    }

    fn device_id(&self) -> Option<String> {
        lock(&self.script.device_id).clone()
    }

    fn set_android_data_directory(&self, path: &CStr) {
        lock(&self.script.data_directories).push(path.to_string_lossy().into_owned());
    }
}
