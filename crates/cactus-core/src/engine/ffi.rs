//! Raw FFI bindings to the native Cactus library (`cactus_ffi.h`,
//! `cactus_util.h`) and the [`Engine`] / [`DeviceRegistry`] implementations
//! built on top of them.
//!
//! Only compiled with the `native` feature, which links `libcactus`.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr::{self, NonNull};

use super::{DeviceRegistry, EmbeddingKind, Engine, Status};
use crate::stream::TokenBridge;

/// Opaque `cactus_model_t`.
pub type CactusModel = *mut c_void;

/// `void (*)(const char *token, uint32_t token_id, void *user_data)`
pub type CactusTokenCallback =
    Option<unsafe extern "C" fn(token: *const c_char, token_id: u32, user_data: *mut c_void)>;

#[link(name = "cactus")]
extern "C" {
    fn cactus_init(
        model_path: *const c_char,
        context_size: usize,
        corpus_dir: *const c_char,
    ) -> CactusModel;

    fn cactus_complete(
        model: CactusModel,
        messages_json: *const c_char,
        response_buffer: *mut c_char,
        buffer_size: usize,
        options_json: *const c_char,
        tools_json: *const c_char,
        callback: CactusTokenCallback,
        user_data: *mut c_void,
    ) -> c_int;

    fn cactus_transcribe(
        model: CactusModel,
        audio_file_path: *const c_char,
        prompt: *const c_char,
        response_buffer: *mut c_char,
        buffer_size: usize,
        options_json: *const c_char,
        callback: CactusTokenCallback,
        user_data: *mut c_void,
    ) -> c_int;

    fn cactus_embed(
        model: CactusModel,
        text: *const c_char,
        embeddings_buffer: *mut f32,
        buffer_size: usize,
        embedding_dim: *mut usize,
    ) -> c_int;

    fn cactus_image_embed(
        model: CactusModel,
        image_path: *const c_char,
        embeddings_buffer: *mut f32,
        buffer_size: usize,
        embedding_dim: *mut usize,
    ) -> c_int;

    fn cactus_audio_embed(
        model: CactusModel,
        audio_path: *const c_char,
        embeddings_buffer: *mut f32,
        buffer_size: usize,
        embedding_dim: *mut usize,
    ) -> c_int;

    fn cactus_reset(model: CactusModel);
    fn cactus_stop(model: CactusModel);
    fn cactus_destroy(model: CactusModel);

    fn register_app(encrypted_data: *const c_char) -> *const c_char;
    fn free_string(s: *const c_char);
    fn get_device_id() -> *const c_char;

    #[cfg(target_os = "android")]
    fn set_android_data_directory(data_dir: *const c_char);
}

/// Loaded native model.
#[derive(Debug)]
pub struct NativeModel(NonNull<c_void>);

// The native model is only touched under the session lock (or by `cactus_stop`,
// which the library allows from any thread).
unsafe impl Send for NativeModel {}

/// Copy of the model pointer used by `cactus_stop`.
#[derive(Debug, Clone, Copy)]
pub struct StopPointer(NonNull<c_void>);

unsafe impl Send for StopPointer {}

fn opt_ptr(s: Option<&CStr>) -> *const c_char {
    s.map_or(ptr::null(), CStr::as_ptr)
}

/// Hook handed to the engine. `user_data` is the `TokenBridge` of the
/// current call, which outlives the native call that receives it.
unsafe extern "C" fn token_trampoline(token: *const c_char, token_id: u32, user_data: *mut c_void) {
    if user_data.is_null() || token.is_null() {
        return;
    }
    let bridge = &mut *(user_data as *mut TokenBridge<'_>);
    let text = CStr::from_ptr(token).to_string_lossy();
    // `emit` contains sink panics, nothing unwinds into the engine.
    bridge.emit(&text, token_id);
}

fn hook_ptr(hook: &mut TokenBridge<'_>) -> *mut c_void {
    hook as *mut TokenBridge<'_> as *mut c_void
}

/// [`Engine`] backed by `libcactus`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeEngine;

impl Engine for NativeEngine {
    type Handle = NativeModel;
    type StopTarget = StopPointer;

    fn init(
        &self,
        model_path: &CStr,
        context_size: usize,
        corpus_dir: Option<&CStr>,
    ) -> Option<NativeModel> {
        let raw = unsafe { cactus_init(model_path.as_ptr(), context_size, opt_ptr(corpus_dir)) };
        NonNull::new(raw).map(NativeModel)
    }

    fn stop_target(&self, handle: &NativeModel) -> StopPointer {
        StopPointer(handle.0)
    }

    fn complete(
        &self,
        handle: &mut NativeModel,
        messages_json: &CStr,
        out: &mut [u8],
        options_json: Option<&CStr>,
        tools_json: Option<&CStr>,
        hook: &mut TokenBridge<'_>,
    ) -> Status {
        unsafe {
            cactus_complete(
                handle.0.as_ptr(),
                messages_json.as_ptr(),
                out.as_mut_ptr().cast::<c_char>(),
                out.len(),
                opt_ptr(options_json),
                opt_ptr(tools_json),
                Some(token_trampoline),
                hook_ptr(hook),
            )
        }
    }

    fn transcribe(
        &self,
        handle: &mut NativeModel,
        audio_path: &CStr,
        prompt: &CStr,
        out: &mut [u8],
        options_json: Option<&CStr>,
        hook: &mut TokenBridge<'_>,
    ) -> Status {
        unsafe {
            cactus_transcribe(
                handle.0.as_ptr(),
                audio_path.as_ptr(),
                prompt.as_ptr(),
                out.as_mut_ptr().cast::<c_char>(),
                out.len(),
                opt_ptr(options_json),
                Some(token_trampoline),
                hook_ptr(hook),
            )
        }
    }

    fn embed(
        &self,
        handle: &mut NativeModel,
        kind: EmbeddingKind,
        input: &CStr,
        out: &mut [f32],
        dimension: &mut usize,
    ) -> Status {
        let call = match kind {
            EmbeddingKind::Text => cactus_embed,
            EmbeddingKind::Image => cactus_image_embed,
            EmbeddingKind::Audio => cactus_audio_embed,
        };
        let capacity_bytes = std::mem::size_of_val(out);
        unsafe {
            call(
                handle.0.as_ptr(),
                input.as_ptr(),
                out.as_mut_ptr(),
                capacity_bytes,
                dimension as *mut usize,
            )
        }
    }

    fn reset(&self, handle: &mut NativeModel) {
        unsafe { cactus_reset(handle.0.as_ptr()) }
    }

    fn stop(&self, target: Option<&StopPointer>) {
        let model = target.map_or(ptr::null_mut(), |t| t.0.as_ptr());
        unsafe { cactus_stop(model) }
    }

    fn destroy(&self, handle: NativeModel) {
        unsafe { cactus_destroy(handle.0.as_ptr()) }
    }
}

/// [`DeviceRegistry`] backed by `libcactus`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeRegistry;

impl DeviceRegistry for NativeRegistry {
    fn register_app(&self, encrypted_payload: &CStr) -> Option<NonNull<c_char>> {
        let raw = unsafe { register_app(encrypted_payload.as_ptr()) };
        NonNull::new(raw.cast_mut())
    }

    unsafe fn free_string(&self, ptr: NonNull<c_char>) {
        free_string(ptr.as_ptr());
    }

    fn device_id(&self) -> Option<String> {
        let raw = unsafe { get_device_id() };
        if raw.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned())
    }

    #[cfg(target_os = "android")]
    fn set_android_data_directory(&self, path: &CStr) {
        unsafe { set_android_data_directory(path.as_ptr()) }
    }

    #[cfg(not(target_os = "android"))]
    fn set_android_data_directory(&self, _path: &CStr) {}
}
