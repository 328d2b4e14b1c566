//! Self-healing session loop of one subscription.
//!
//! A [`Supervisor`] keeps a subscription alive until it is cancelled. Each
//! *session* creates a consumer client through the factory, wires the client's
//! log channel and message flow to a dispatcher, subscribes and listens. When
//! the session ends for any reason other than cancellation, the supervisor
//! waits [`SupervisorOptions::retry_delay`] and starts a new one.
//!
//! Cancellation has two levels. The caller's token stops everything. Each
//! session also owns a child token that the supervisor cancels itself when the
//! client reports a fatal [`LogKind`](crate::broker::LogKind). Only the caller's
//! token removes broker-side bindings on the way out (when the subscription
//! asks for it); a forced stop leaves them in place for the next session.
//!
//! The dispatcher belongs to the subscription, not to a session. Events an
//! asynchronous subscription has already queued keep being processed across
//! a forced restart and are only dropped when the caller's token fires.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    Envelope,
    broker::{LogCallback, LogEvent, LogKind},
    consumer::{
        ConsumerClient, ConsumerClientFactory, ConsumerError, Disposition, HeaderEnricher,
        ListenContext, ListenOptions, MessageHandler,
    },
    dispatcher::{Dispatcher, QueuedDispatcher, RetryPolicy, SyncDispatcher},
    envelope::codec::{CloudEventsCodec, EnvelopeCodec},
    subscriber::{InvalidSubscription, Subscriber, Subscription},
};

/// Settings shared by every subscription a supervisor runs.
#[derive(Clone)]
pub struct SupervisorOptions {
    /// Pause between the end of a failed session and the next one.
    pub retry_delay: Duration,
    /// Longest single poll of the listen loop.
    pub poll_timeout: Duration,
    /// Retry budget of asynchronous subscriptions.
    pub retry: RetryPolicy,
    /// Extra headers computed per received message.
    pub enricher: Option<HeaderEnricher>,
    pub codec: Arc<dyn EnvelopeCodec>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            enricher: None,
            codec: Arc::new(CloudEventsCodec),
        }
    }
}

impl SupervisorOptions {
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_enricher(mut self, enricher: HeaderEnricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn with_codec(mut self, codec: impl EnvelopeCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }
}

/// How a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The caller cancelled; the subscription is shutting down.
    Cancelled,
    /// The client reported a fatal condition; a new session follows.
    Forced,
}

/// Runs subscriptions against one broker.
pub struct Supervisor<F, HK = DefaultSupervisorHook> {
    factory: Arc<F>,
    options: SupervisorOptions,
    hook: Arc<HK>,
}

impl<F: ConsumerClientFactory> Supervisor<F, DefaultSupervisorHook> {
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            options: SupervisorOptions::default(),
            hook: Arc::new(DefaultSupervisorHook),
        }
    }
}

impl<F, HK> Supervisor<F, HK>
where
    F: ConsumerClientFactory,
    HK: SupervisorHook + 'static,
{
    pub fn with_options(mut self, options: SupervisorOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the hook, keeping the factory and options.
    pub fn with_hook<HK2: SupervisorHook + 'static>(self, hook: HK2) -> Supervisor<F, HK2> {
        Supervisor {
            factory: self.factory,
            options: self.options,
            hook: Arc::new(hook),
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Keep `subscriber` served until `cancel` fires.
    ///
    /// Fails only when the subscription is invalid; broker failures are
    /// reported to the hook and retried.
    #[tracing::instrument(skip_all)]
    pub async fn run(
        &self,
        subscriber: Arc<dyn Subscriber>,
        cancel: CancellationToken,
    ) -> Result<(), InvalidSubscription> {
        let subscription = subscriber.subscription();
        subscription.validate()?;
        self.hook.on_startup(&subscription);

        // Outlives sessions: a forced restart must not drop queued events.
        let dispatcher: Box<dyn Dispatcher> = if subscription.is_async() {
            Box::new(QueuedDispatcher::new(
                Arc::clone(&subscriber),
                self.options.retry,
                subscription.commit(),
                &cancel,
            ))
        } else {
            Box::new(SyncDispatcher::new(Arc::clone(&subscriber)))
        };

        let mut attempt = 0u64;
        while !cancel.is_cancelled() {
            attempt += 1;
            self.hook.on_session_start(&subscription, attempt);

            match self
                .run_session(dispatcher.as_ref(), &subscription, &cancel)
                .await
            {
                Ok(end) => self.hook.on_session_end(&subscription, end),
                Err(err) => self.hook.on_session_error(&subscription, &err),
            }

            if cancel.is_cancelled() {
                break;
            }
            self.hook
                .on_restart_scheduled(&subscription, self.options.retry_delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.retry_delay) => {}
            }
        }

        dispatcher.close().await;
        self.hook.on_shutdown(&subscription);
        Ok(())
    }

    async fn run_session(
        &self,
        dispatcher: &dyn Dispatcher,
        subscription: &Subscription,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, ConsumerError> {
        let mut client = self
            .factory
            .create(subscription.group(), subscription.is_auto_unsubscribe())
            .await?;

        let session = cancel.child_token();

        let forced = Arc::new(AtomicBool::new(false));
        let log = self.log_callback(subscription, cancel, &session, &forced);
        client.on_log(Arc::clone(&log));

        let mut topics: Vec<String> = subscription.topics().iter().cloned().collect();
        let handler = SessionHandler { dispatcher };
        let ctx = ListenContext {
            options: ListenOptions::default()
                .with_poll_timeout(self.options.poll_timeout)
                .with_max_in_flight(subscription.in_flight_limit()),
            codec: self.options.codec.as_ref(),
            handler: &handler,
            log: &log,
            enricher: self.options.enricher.as_ref(),
        };

        let outcome = async {
            topics = client.fetch_topics(&topics).await?;
            client.subscribe(&topics).await?;
            client.listen(ctx, &session).await
        }
        .await;

        let forced = forced.load(Ordering::SeqCst);
        if subscription.is_auto_unsubscribe() && cancel.is_cancelled() && !forced {
            if let Err(err) = client.unsubscribe(&topics).await {
                tracing::warn!(error = %err, "Unsubscribe failed");
            }
        }
        client.dispose().await;
        session.cancel();

        outcome.map(|()| {
            if forced {
                SessionEnd::Forced
            } else {
                SessionEnd::Cancelled
            }
        })
    }

    /// Log channel of one session: forwards every event to the hook and stops
    /// the session on fatal kinds unless the caller is already shutting down.
    fn log_callback(
        &self,
        subscription: &Subscription,
        cancel: &CancellationToken,
        session: &CancellationToken,
        forced: &Arc<AtomicBool>,
    ) -> LogCallback {
        let hook = Arc::clone(&self.hook);
        let subscription = subscription.clone();
        let cancel = cancel.clone();
        let session = session.clone();
        let forced = Arc::clone(forced);

        Arc::new(move |event: LogEvent| {
            hook.on_log_event(&subscription, &event);
            if event.kind.is_fatal() && !cancel.is_cancelled() {
                forced.store(true, Ordering::SeqCst);
                session.cancel();
            }
        })
    }
}

/// Validates, dispatches and maps the outcome to a disposition.
struct SessionHandler<'a> {
    dispatcher: &'a dyn Dispatcher,
}

#[async_trait::async_trait]
impl MessageHandler for SessionHandler<'_> {
    async fn handle(&self, envelope: Envelope) -> Disposition {
        if let Err(err) = envelope.validate() {
            tracing::error!(id = %envelope.id(), error = %err, "Invalid event discarded");
            return Disposition::Commit;
        }

        let id = envelope.id().to_owned();
        match self.dispatcher.dispatch(envelope).await {
            Ok(()) => Disposition::Commit,
            Err(err) => {
                tracing::warn!(id, error = %err, "Event rejected");
                Disposition::Reject
            }
        }
    }
}

/// Observes the session loop of each subscription.
///
/// Called synchronously from the loop (and, for `on_log_event`, from driver
/// callbacks), so implementations must not block.
pub trait SupervisorHook: Send + Sync {
    fn on_startup(&self, subscription: &Subscription);
    fn on_shutdown(&self, subscription: &Subscription);
    fn on_session_start(&self, subscription: &Subscription, attempt: u64);
    fn on_session_end(&self, subscription: &Subscription, end: SessionEnd);
    fn on_session_error(&self, subscription: &Subscription, error: &ConsumerError);
    fn on_log_event(&self, subscription: &Subscription, event: &LogEvent);
    fn on_restart_scheduled(&self, subscription: &Subscription, delay: Duration);
}

/// Logs every supervisor event through `tracing`.
pub struct DefaultSupervisorHook;

impl SupervisorHook for DefaultSupervisorHook {
    fn on_startup(&self, subscription: &Subscription) {
        tracing::info!(group = subscription.group(), topics = ?subscription.topics(), "Subscription starting");
    }

    fn on_shutdown(&self, subscription: &Subscription) {
        tracing::info!(group = subscription.group(), "Subscription stopped");
    }

    fn on_session_start(&self, subscription: &Subscription, attempt: u64) {
        tracing::debug!(group = subscription.group(), attempt, "Session starting");
    }

    fn on_session_end(&self, subscription: &Subscription, end: SessionEnd) {
        tracing::debug!(group = subscription.group(), ?end, "Session ended");
    }

    fn on_session_error(&self, subscription: &Subscription, error: &ConsumerError) {
        tracing::error!(group = subscription.group(), %error, "Session failed");
    }

    fn on_log_event(&self, subscription: &Subscription, event: &LogEvent) {
        let group = subscription.group();
        let kind = event.kind.as_label();
        if event.kind.is_fatal() {
            tracing::error!(group, kind, reason = %event.reason, "Broker reported a fatal condition");
        } else if matches!(event.kind, LogKind::ConsumeError | LogKind::ConsumeRetry) {
            tracing::warn!(group, kind, reason = %event.reason, "Broker event");
        } else {
            tracing::debug!(group, kind, reason = %event.reason, "Broker event");
        }
    }

    fn on_restart_scheduled(&self, subscription: &Subscription, delay: Duration) {
        tracing::info!(group = subscription.group(), ?delay, "Restarting subscription");
    }
}
