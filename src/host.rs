//! Runs every registered subscription as its own task.
//!
//! Subscribers are passed in explicitly; there is no discovery. Each one gets
//! a [`Supervisor::run`] task, and all of them share the host's cancellation
//! token so [`Host::stop`] can shut them down together.

use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_error::SpanTrace;

use crate::{
    consumer::ConsumerClientFactory,
    subscriber::{InvalidSubscription, Subscriber},
    supervisor::{DefaultSupervisorHook, Supervisor, SupervisorHook},
};

/// Owner of the subscription tasks.
pub struct Host<F, HK = DefaultSupervisorHook> {
    supervisor: Arc<Supervisor<F, HK>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl<F, HK> Host<F, HK>
where
    F: ConsumerClientFactory,
    HK: SupervisorHook + 'static,
{
    pub fn new(supervisor: Supervisor<F, HK>) -> Self {
        Self {
            supervisor: Arc::new(supervisor),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Token cancelled by [`stop`](Host::stop).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of subscription tasks still running.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Start one supervised task per subscriber and return how many started.
    ///
    /// Every subscription is validated first; if one is invalid nothing is
    /// started.
    #[tracing::instrument(skip_all)]
    pub fn start<I>(&self, subscribers: I) -> Result<usize, HostError>
    where
        I: IntoIterator<Item = Arc<dyn Subscriber>>,
    {
        if self.cancel.is_cancelled() {
            return Err(HostError::new(HostErrorKind::Stopped));
        }

        let subscribers: Vec<Arc<dyn Subscriber>> = subscribers.into_iter().collect();
        if subscribers.is_empty() {
            tracing::warn!("No subscribers registered");
            return Ok(0);
        }

        let mut groups = HashSet::new();
        for subscriber in &subscribers {
            let subscription = subscriber.subscription();
            subscription.validate().map_err(|source| {
                HostError::new(HostErrorKind::InvalidSubscription {
                    group: subscription.group().to_owned(),
                    source,
                })
            })?;
            if !groups.insert(subscription.group().to_owned()) {
                tracing::warn!(
                    group = subscription.group(),
                    "Several subscribers share a group and will compete for its messages"
                );
            }
        }

        let started = subscribers.len();
        for subscriber in subscribers {
            let supervisor = Arc::clone(&self.supervisor);
            let cancel = self.cancel.clone();
            self.tracker.spawn(async move {
                if let Err(err) = supervisor.run(subscriber, cancel).await {
                    tracing::error!(error = %err, "Subscription refused");
                }
            });
        }
        tracing::info!(started, "Subscriptions started");
        Ok(started)
    }

    /// Cancel every subscription and wait up to `timeout` for them to finish.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, timeout: Duration) -> Result<(), HostError> {
        self.cancel.cancel();
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                tracing::info!("All subscriptions stopped");
                Ok(())
            }
            Err(_) => Err(HostError::new(HostErrorKind::ShutdownTimeout {
                timeout,
                pending: self.tracker.len(),
            })),
        }
    }
}

/// Host errors.
#[derive(Debug)]
pub struct HostError {
    context: SpanTrace,
    kind: HostErrorKind,
}

/// Host errors kind.
#[derive(Debug)]
pub enum HostErrorKind {
    /// A subscriber declared an unusable subscription.
    InvalidSubscription {
        group: String,
        source: InvalidSubscription,
    },
    /// `start` was called after `stop`.
    Stopped,
    /// Subscriptions still running when the stop timeout elapsed.
    ShutdownTimeout { timeout: Duration, pending: usize },
}

impl HostError {
    fn new(kind: HostErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &HostErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            HostErrorKind::InvalidSubscription { group, source } => {
                writeln!(f, "Invalid subscription {group:?}: {source}")
            }
            HostErrorKind::Stopped => writeln!(f, "Host already stopped"),
            HostErrorKind::ShutdownTimeout { timeout, pending } => {
                writeln!(f, "{pending} subscription(s) still running after {timeout:?}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            HostErrorKind::InvalidSubscription { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        BoxError, Envelope,
        consumer::InMemoryConsumerFactory,
        envelope::codec::{CloudEventsCodec, ContentMode, EnvelopeCodec},
        subscriber::{FnSubscriber, Subscription},
        transport::InMemoryBroker,
    };

    fn counting(group: &str, topic: &str, seen: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Subscriber> {
        let seen = Arc::clone(seen);
        let label = group.to_owned();
        Arc::new(FnSubscriber::new(
            Subscription::new(group, [topic]),
            move |envelope: Envelope| {
                let seen = Arc::clone(&seen);
                let label = label.clone();
                async move {
                    seen.lock().push(format!("{label}:{}", envelope.id()));
                    Ok::<_, BoxError>(())
                }
            },
        ))
    }

    fn host(broker: &InMemoryBroker) -> Host<InMemoryConsumerFactory> {
        Host::new(Supervisor::new(InMemoryConsumerFactory::new(broker.clone())))
    }

    #[tokio::test]
    async fn runs_each_subscription_independently() {
        let broker = InMemoryBroker::new();
        let host = host(&broker);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let started = host
            .start([
                counting("billing", "orders.*", &seen),
                counting("shipping", "orders.created", &seen),
            ])
            .unwrap();
        assert_eq!(started, 2);

        while broker.stats("billing").bindings.is_empty()
            || broker.stats("shipping").bindings.is_empty()
        {
            tokio::task::yield_now().await;
        }
        let envelope = Envelope::builder("1", "orders.created").build();
        broker.publish(CloudEventsCodec.encode(&envelope, ContentMode::Binary).unwrap());
        while seen.lock().len() < 2 {
            tokio::task::yield_now().await;
        }

        host.stop(Duration::from_secs(5)).await.unwrap();

        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen, ["billing:1", "shipping:1"]);
        assert_eq!(host.running(), 0);
    }

    #[tokio::test]
    async fn invalid_subscription_starts_nothing() {
        let broker = InMemoryBroker::new();
        let host = host(&broker);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let err = host
            .start([
                counting("billing", "orders.*", &seen),
                counting("shipping", "", &seen),
            ])
            .unwrap_err();

        assert!(matches!(
            err.kind(),
            HostErrorKind::InvalidSubscription { group, .. } if group == "shipping"
        ));
        assert_eq!(host.running(), 0);
    }

    #[tokio::test]
    async fn start_after_stop_is_refused() {
        let broker = InMemoryBroker::new();
        let host = host(&broker);
        host.stop(Duration::from_secs(1)).await.unwrap();

        let err = host.start([counting("billing", "orders.*", &Arc::default())]).unwrap_err();
        assert!(matches!(err.kind(), HostErrorKind::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_times_out_on_stuck_callback() {
        let broker = InMemoryBroker::new();
        let host = host(&broker);
        let stuck: Arc<dyn Subscriber> = Arc::new(FnSubscriber::new(
            Subscription::new("billing", ["orders.*"]),
            |_envelope: Envelope| std::future::pending::<Result<(), BoxError>>(),
        ));
        host.start([stuck]).unwrap();
        while broker.stats("billing").bindings.is_empty() {
            tokio::task::yield_now().await;
        }
        let envelope = Envelope::builder("1", "orders.created").build();
        broker.publish(CloudEventsCodec.encode(&envelope, ContentMode::Binary).unwrap());
        while broker.stats("billing").unacked == 0 {
            tokio::task::yield_now().await;
        }

        let err = host.stop(Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(
            err.kind(),
            HostErrorKind::ShutdownTimeout { pending: 1, .. }
        ));
    }
}
