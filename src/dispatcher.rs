//! Hand-off of decoded envelopes to application callbacks.
//!
//! Two strategies implement [`Dispatcher`]:
//!
//! - [`SyncDispatcher`] runs the callback inline and reports its outcome, so
//!   the listen loop commits on success and rejects on failure.
//! - [`QueuedDispatcher`] appends the envelope to an unbounded FIFO queue
//!   drained by one background worker, which retries failed callbacks with
//!   exponential backoff. With [`CommitPolicy::BeforeProcess`] `dispatch`
//!   returns as soon as the envelope is queued and the listen loop commits
//!   right away; an envelope whose retries run out is logged and lost.
//!   [`CommitPolicy::AfterProcess`] waits for the worker's verdict instead.
//!
//! A dispatcher lives as long as its subscription; listen sessions come and
//! go underneath it. A callback that panics counts as a failed callback.

pub mod queued;
pub mod retry;
pub mod sync;

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing_error::SpanTrace;

use crate::{Envelope, subscriber::Subscriber};

pub use queued::QueuedDispatcher;
pub use retry::{BackoffPolicy, RetryPolicy};
pub use sync::SyncDispatcher;

/// When a queued envelope's broker message is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Commit once the envelope is queued. Retries happen after the commit, so
    /// a crash or exhausted retries lose the event.
    #[default]
    BeforeProcess,
    /// Commit or reject once the callback succeeded or its retries ran out.
    AfterProcess,
}

/// Strategy invoking the application callback for one envelope.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    /// Deliver one valid envelope.
    ///
    /// `Ok` means the broker message may be committed, `Err` that it should be
    /// rejected.
    async fn dispatch(&self, envelope: Envelope) -> Result<(), DispatchError>;

    /// Stop accepting envelopes and release background resources.
    async fn close(&self) {}
}

/// Run the callback of `subscriber`, turning a panic into an error.
async fn invoke(subscriber: &dyn Subscriber, envelope: &Envelope) -> Result<(), tower::BoxError> {
    match AssertUnwindSafe(subscriber.on_event(envelope)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = if let Some(msg) = panic.downcast_ref::<&str>() {
                (*msg).to_owned()
            } else if let Some(msg) = panic.downcast_ref::<String>() {
                msg.clone()
            } else {
                "unknown panic".to_owned()
            };
            tracing::error!(id = %envelope.id(), %reason, "Callback panicked");
            Err(format!("callback panicked: {reason}").into())
        }
    }
}

/// Error returned by [`Dispatcher::dispatch`].
#[derive(Debug)]
pub struct DispatchError {
    context: SpanTrace,
    kind: DispatchErrorKind,
}

/// Dispatch errors kind.
#[derive(Debug)]
pub enum DispatchErrorKind {
    /// The application callback failed.
    Callback(tower::BoxError),
    /// The callback kept failing until the retry budget was spent.
    Exhausted {
        attempts: u32,
        source: tower::BoxError,
    },
    /// The dispatcher was closed while the envelope was waiting.
    Cancelled,
    /// The dispatcher no longer accepts envelopes.
    Closed,
}

impl DispatchError {
    fn new(kind: DispatchErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn callback(err: tower::BoxError) -> Self {
        Self::new(DispatchErrorKind::Callback(err))
    }

    pub fn exhausted(attempts: u32, source: tower::BoxError) -> Self {
        Self::new(DispatchErrorKind::Exhausted { attempts, source })
    }

    pub fn cancelled() -> Self {
        Self::new(DispatchErrorKind::Cancelled)
    }

    pub fn closed() -> Self {
        Self::new(DispatchErrorKind::Closed)
    }

    pub fn kind(&self) -> &DispatchErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DispatchErrorKind::Callback(err) => writeln!(f, "Callback error: {err}"),
            DispatchErrorKind::Exhausted { attempts, source } => {
                writeln!(f, "Callback failed {attempts} times: {source}")
            }
            DispatchErrorKind::Cancelled => writeln!(f, "Dispatch cancelled"),
            DispatchErrorKind::Closed => writeln!(f, "Dispatcher closed"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DispatchErrorKind::Callback(err) => Some(err.as_ref()),
            DispatchErrorKind::Exhausted { source, .. } => Some(source.as_ref()),
            DispatchErrorKind::Cancelled | DispatchErrorKind::Closed => None,
        }
    }
}
