use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    Envelope,
    dispatcher::{CommitPolicy, DispatchError, Dispatcher, retry::RetryErrorKind, RetryPolicy},
    subscriber::Subscriber,
};

struct Job {
    envelope: Envelope,
    done: Option<oneshot::Sender<Result<(), DispatchError>>>,
}

/// Queues envelopes for a single background worker.
///
/// The worker processes envelopes strictly in arrival order and runs each
/// callback under the [`RetryPolicy`]. A callback that keeps failing is logged
/// and skipped; the queue keeps going.
///
/// [`close`](Dispatcher::close) cancels the worker. Whatever is still queued
/// at that point is dropped and counted in a warning.
pub struct QueuedDispatcher {
    sender: mpsc::UnboundedSender<Job>,
    commit: CommitPolicy,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedDispatcher {
    /// Spawn the worker. It also stops when `parent` is cancelled.
    pub fn new(
        subscriber: Arc<dyn Subscriber>,
        retry: RetryPolicy,
        commit: CommitPolicy,
        parent: &CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = parent.child_token();
        let worker = tokio::spawn(run_worker(subscriber, retry, receiver, cancel.clone()));

        Self {
            sender,
            commit,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn commit_policy(&self) -> CommitPolicy {
        self.commit
    }
}

#[async_trait::async_trait]
impl Dispatcher for QueuedDispatcher {
    async fn dispatch(&self, envelope: Envelope) -> Result<(), DispatchError> {
        match self.commit {
            CommitPolicy::BeforeProcess => {
                self.sender
                    .send(Job {
                        envelope,
                        done: None,
                    })
                    .map_err(|_| DispatchError::closed())?;
                Ok(())
            }
            CommitPolicy::AfterProcess => {
                let (done, outcome) = oneshot::channel();
                self.sender
                    .send(Job {
                        envelope,
                        done: Some(done),
                    })
                    .map_err(|_| DispatchError::closed())?;
                outcome.await.map_err(|_| DispatchError::cancelled())?
            }
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "Dispatch worker panicked");
            }
        }
    }
}

#[tracing::instrument(skip_all)]
async fn run_worker(
    subscriber: Arc<dyn Subscriber>,
    retry: RetryPolicy,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };

        let envelope = &job.envelope;
        let outcome = match retry
            .run(&cancel, |_| super::invoke(subscriber.as_ref(), envelope))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == RetryErrorKind::Cancelled => {
                tracing::warn!(id = %envelope.id(), attempts = err.attempts(), "Retries cancelled");
                Err(DispatchError::cancelled())
            }
            Err(err) => {
                tracing::error!(
                    id = %envelope.id(),
                    event_type = %envelope.event_type(),
                    attempts = err.attempts(),
                    error = %err.last_error(),
                    "Event handling failed after all retries",
                );
                let attempts = err.attempts();
                Err(DispatchError::exhausted(attempts, err.into_last_error()))
            }
        };

        if let Some(done) = job.done {
            let _ = done.send(outcome);
        }
    }

    receiver.close();
    let mut dropped = 0usize;
    while let Ok(job) = receiver.try_recv() {
        dropped += 1;
        if let Some(done) = job.done {
            let _ = done.send(Err(DispatchError::cancelled()));
        }
    }
    if dropped > 0 {
        tracing::warn!(dropped, "Dispatcher closed with queued events");
    }
}
