//! Per-token streaming between the engine and caller-supplied sinks.
//!
//! The engine reports tokens through a hook while a `complete` or
//! `transcribe` call is blocking. [`TokenBridge`] is what the hook talks to:
//! it borrows the caller's sink for exactly the duration of that one call and
//! forwards each token synchronously, on the worker thread, in the order the
//! engine emitted it. Without a sink every emission is dropped.
//!
//! A sink that panics is detached for the rest of the call; the panic never
//! reaches the engine and the call itself still completes.

use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tracing::warn;

/// Caller-supplied receiver of `(token_text, token_id)` events.
pub type TokenSink = Box<dyn FnMut(&str, u32) + Send>;

/// Hook context for a single engine call.
pub struct TokenBridge<'a> {
    sink: Option<&'a mut TokenSink>,
    delivered: usize,
}

impl<'a> TokenBridge<'a> {
    pub fn new(sink: Option<&'a mut TokenSink>) -> Self {
        Self { sink, delivered: 0 }
    }

    /// A bridge that swallows every token.
    pub fn detached() -> Self {
        Self::new(None)
    }

    /// Forward one token to the sink, if there is one.
    pub fn emit(&mut self, token: &str, token_id: u32) {
        let Some(sink) = self.sink.as_deref_mut() else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| sink(token, token_id))) {
            Ok(()) => self.delivered += 1,
            Err(_) => {
                warn!(token_id, "token sink panicked, detaching it for the rest of the call");
                self.detach();
            }
        }
    }

    /// Stop forwarding for the rest of the call.
    pub fn detach(&mut self) {
        self.sink = None;
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Number of tokens handed to the sink so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }
}

/// One token as seen by a [`TokenStream`] consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEvent {
    pub token: String,
    pub token_id: u32,
}

/// Async view over the tokens of one call.
///
/// The stream ends once the sink half is dropped, which happens when the
/// worker running the call finishes.
pub struct TokenStream {
    inner: UnboundedReceiverStream<TokenEvent>,
}

impl Stream for TokenStream {
    type Item = TokenEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Create a sink that feeds a [`TokenStream`].
pub fn token_channel() -> (TokenSink, TokenStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: TokenSink = Box::new(move |token: &str, token_id: u32| {
        // Receiver gone means nobody is listening any more.
        let _ = tx.send(TokenEvent {
            token: token.to_string(),
            token_id,
        });
    });
    let stream = TokenStream {
        inner: UnboundedReceiverStream::new(rx),
    };
    (sink, stream)
}
