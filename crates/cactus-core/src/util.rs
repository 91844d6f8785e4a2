//! Device registration, device id and platform data directory.
//!
//! These calls share nothing with a [`Session`](crate::Session). Each one is
//! dispatched on its own and serialized only against other utility calls.

use std::ffi::{c_char, CStr, CString};
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::dispatch::{Dispatcher, Pending};
use crate::engine::DeviceRegistry;
use crate::error::{Error, Result};

/// String owned by the registry, released on drop.
struct RegistryString<'r, R: DeviceRegistry> {
    registry: &'r R,
    ptr: NonNull<c_char>,
}

impl<R: DeviceRegistry> RegistryString<'_, R> {
    fn to_owned_string(&self) -> String {
        unsafe { CStr::from_ptr(self.ptr.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

impl<R: DeviceRegistry> Drop for RegistryString<'_, R> {
    fn drop(&mut self) {
        // The pointer came from `register_app` on this registry and is freed once.
        unsafe { self.registry.free_string(self.ptr) }
    }
}

struct UtilityInner<R> {
    registry: R,
    guard: Mutex<()>,
}

impl<R> UtilityInner<R> {
    fn serialize(&self) -> MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Async front for a [`DeviceRegistry`].
pub struct Utility<R: DeviceRegistry> {
    inner: Arc<UtilityInner<R>>,
    dispatcher: Dispatcher,
}

impl<R: DeviceRegistry> Clone for Utility<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<R: DeviceRegistry> fmt::Debug for Utility<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Utility").finish_non_exhaustive()
    }
}

impl<R: DeviceRegistry> Utility<R> {
    pub fn new(registry: R) -> Result<Self> {
        Ok(Self::with_dispatcher(registry, Dispatcher::current()?))
    }

    pub fn with_dispatcher(registry: R, dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(UtilityInner {
                registry,
                guard: Mutex::new(()),
            }),
            dispatcher,
        }
    }

    pub fn registry(&self) -> &R {
        &self.inner.registry
    }

    /// Register this app with an encrypted payload and return the registry's answer.
    pub fn register_app(&self, encrypted_payload: &str) -> Pending<String> {
        let inner = self.inner.clone();
        let payload = encrypted_payload.to_string();

        self.dispatcher.dispatch("register_app", move || {
            let payload = CString::new(payload).map_err(|_| {
                Error::InvalidArgument("registration payload contains a NUL byte".to_string())
            })?;

            let _serial = inner.serialize();
            let ptr = inner
                .registry
                .register_app(&payload)
                .ok_or(Error::RegistrationFailed)?;

            let owned = RegistryString {
                registry: &inner.registry,
                ptr,
            };
            let response = owned.to_owned_string();
            drop(owned);

            debug!("app registered");
            Ok(response)
        })
    }

    /// Device id assigned by the registry, if any.
    pub fn get_device_id(&self) -> Pending<Option<String>> {
        let inner = self.inner.clone();
        self.dispatcher.dispatch("get_device_id", move || {
            let _serial = inner.serialize();
            Ok(inner.registry.device_id())
        })
    }

    /// Point the native library at its data directory.
    ///
    /// Only Android needs this. Elsewhere it does nothing; it never fails.
    pub fn set_platform_data_directory(&self, path: &str) -> Pending<()> {
        let inner = self.inner.clone();
        let path = path.to_string();

        self.dispatcher
            .dispatch("set_platform_data_directory", move || {
                if !cfg!(target_os = "android") {
                    debug!(path = %path, "platform data directory only applies on Android");
                    return Ok(());
                }
                match CString::new(path) {
                    Ok(path) => {
                        let _serial = inner.serialize();
                        inner.registry.set_android_data_directory(&path);
                    }
                    Err(_) => warn!("data directory contains a NUL byte, ignoring"),
                }
                Ok(())
            })
    }
}
