//! The narrow interface to the native engine and utility library.
//!
//! Everything behind these traits is opaque: model loading, tokenization,
//! sampling and preprocessing all live in the engine. The session only moves
//! handles, strings and buffers across this seam.

use std::ffi::{c_char, CStr};
use std::fmt;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use crate::stream::TokenBridge;

#[cfg(feature = "native")]
pub mod ffi;

#[cfg(feature = "native")]
pub use ffi::{NativeEngine, NativeRegistry};

/// Status code returned by engine calls. Negative values are failures.
pub type Status = i32;

/// Input modality for embedding calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingKind {
    #[default]
    Text,
    Image,
    Audio,
}

impl fmt::Display for EmbeddingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// A loaded-model engine reached through an opaque handle.
///
/// All methods are blocking. Callers guarantee that at most one method runs
/// against a given handle at a time, except [`Engine::stop`], which may run
/// concurrently with any of them.
pub trait Engine: Send + Sync + 'static {
    /// Owned handle to a loaded model. Released only through [`Engine::destroy`].
    type Handle: Send + 'static;

    /// What `stop` needs to reach a running call without borrowing the handle.
    type StopTarget: Send + 'static;

    fn init(
        &self,
        model_path: &CStr,
        context_size: usize,
        corpus_dir: Option<&CStr>,
    ) -> Option<Self::Handle>;

    fn stop_target(&self, handle: &Self::Handle) -> Self::StopTarget;

    /// Generate a reply into `out`, NUL-terminated, emitting tokens through `hook`.
    ///
    /// The hook must not be used after this method returns.
    fn complete(
        &self,
        handle: &mut Self::Handle,
        messages_json: &CStr,
        out: &mut [u8],
        options_json: Option<&CStr>,
        tools_json: Option<&CStr>,
        hook: &mut TokenBridge<'_>,
    ) -> Status;

    fn transcribe(
        &self,
        handle: &mut Self::Handle,
        audio_path: &CStr,
        prompt: &CStr,
        out: &mut [u8],
        options_json: Option<&CStr>,
        hook: &mut TokenBridge<'_>,
    ) -> Status;

    /// Write an embedding into `out` and report the number of elements used.
    fn embed(
        &self,
        handle: &mut Self::Handle,
        kind: EmbeddingKind,
        input: &CStr,
        out: &mut [f32],
        dimension: &mut usize,
    ) -> Status;

    fn reset(&self, handle: &mut Self::Handle);

    /// Ask a running generation to abort. `None` when no model is loaded.
    fn stop(&self, target: Option<&Self::StopTarget>);

    fn destroy(&self, handle: Self::Handle);
}

/// Device registration and licensing calls.
pub trait DeviceRegistry: Send + Sync + 'static {
    /// Returns a string owned by the registry, or `None` when rejected.
    fn register_app(&self, encrypted_payload: &CStr) -> Option<NonNull<c_char>>;

    /// Release a string returned by [`DeviceRegistry::register_app`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `register_app` on this registry and must not be
    /// used or freed again afterwards.
    unsafe fn free_string(&self, ptr: NonNull<c_char>);

    fn device_id(&self) -> Option<String>;

    /// Only meaningful on Android; other platforms never call it.
    fn set_android_data_directory(&self, path: &CStr);
}
