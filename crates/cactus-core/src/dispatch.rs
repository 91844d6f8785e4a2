//! Background dispatch of blocking session work.
//!
//! Every public operation is handed to the tokio blocking pool as soon as it
//! is called and the caller gets a [`Pending`] back. The work itself may block
//! twice: once waiting for the session lock and once inside the engine. Both
//! waits happen on a pool thread, never on the caller's task, and the pool
//! grows to more than one thread, so a queued operation waiting for the lock
//! cannot starve the one holding it.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};

/// Runs session operations on the blocking pool of a tokio runtime.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    runtime: Handle,
}

impl Dispatcher {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Dispatcher for the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| Error::NoRuntime)
    }

    /// Start `work` on a pool thread and return its pending result.
    pub fn dispatch<T, F>(&self, operation: &'static str, work: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        debug!(operation, "dispatching");
        Pending {
            operation,
            task: self.runtime.spawn_blocking(work),
        }
    }
}

/// Result of a dispatched operation.
///
/// The work is already running when this is returned. Dropping it does not
/// cancel anything; use `Session::stop` to cut a generation short.
#[must_use = "the operation runs regardless, but its result is lost unless awaited"]
#[derive(Debug)]
pub struct Pending<T> {
    operation: &'static str,
    task: JoinHandle<Result<T>>,
}

impl<T> Pending<T> {
    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(Error::WorkerFailed {
                operation: this.operation,
                message: e.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn resolves_with_work_result() {
        let dispatcher = Dispatcher::current().unwrap();
        let value = assert_ok!(dispatcher.dispatch("answer", || Ok(42)).await);
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn panicking_work_becomes_worker_failure() {
        let dispatcher = Dispatcher::current().unwrap();
        let pending = dispatcher.dispatch::<(), _>("explode", || panic!("boom"));
        assert_eq!(pending.operation(), "explode");
        let err = assert_err!(pending.await);
        assert!(matches!(
            err,
            Error::WorkerFailed {
                operation: "explode",
                ..
            }
        ));
    }

    #[test]
    fn no_runtime_outside_tokio() {
        assert!(matches!(Dispatcher::current(), Err(Error::NoRuntime)));
    }

    #[test]
    fn work_starts_before_it_is_awaited() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dispatcher = Dispatcher::new(runtime.handle().clone());
        let (tx, rx) = std::sync::mpsc::channel();

        let pending = dispatcher.dispatch("eager", move || {
            tx.send(()).unwrap();
            Ok(())
        });

        // Never polled yet, the worker still runs.
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        runtime.block_on(pending).unwrap();
    }
}
