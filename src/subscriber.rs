//! Application-facing subscription API.
//!
//! A [`Subscriber`] declares what it listens to through a [`Subscription`]
//! and receives each valid envelope through [`Subscriber::on_event`]. The
//! [`Host`](crate::Host) runs one supervised session loop per subscriber.
//!
//! [`TopicRouter`] serves several topics from one subscriber with a handler
//! per topic, and [`FnSubscriber`] wraps a single closure.
//!
//! ## Example
//!
//! ```rust
//! use switchyard::{BoxError, Envelope, subscriber::{Subscriber, TopicRouter}};
//!
//! let router = TopicRouter::new("billing")
//!     .route("orders.created", |envelope: Envelope| async move {
//!         println!("new order {}", envelope.id());
//!         Ok::<_, BoxError>(())
//!     })
//!     .route("orders.*", |_envelope: Envelope| async { Ok::<_, BoxError>(()) });
//!
//! let subscription = router.subscription();
//! assert_eq!(subscription.group(), "billing");
//! assert_eq!(subscription.topics().len(), 2);
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    num::NonZeroUsize,
    sync::Arc,
};

use crate::{Envelope, broker::topic_matches, dispatcher::CommitPolicy};

/// What a subscriber listens to and how its events are dispatched.
///
/// The group is the consumer-group id on Kafka and the queue name on
/// RabbitMQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    topics: BTreeSet<String>,
    group: String,
    is_async: bool,
    auto_unsubscribe: bool,
    commit: CommitPolicy,
    max_in_flight: NonZeroUsize,
}

impl Subscription {
    /// Synchronous subscription that unsubscribes on shutdown.
    pub fn new<T>(group: impl Into<String>, topics: impl IntoIterator<Item = T>) -> Self
    where
        T: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            group: group.into(),
            is_async: false,
            auto_unsubscribe: true,
            commit: CommitPolicy::default(),
            max_in_flight: NonZeroUsize::MIN,
        }
    }

    /// Dispatch through the retrying background queue.
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// Whether to remove broker-side bindings when the host shuts down.
    /// Defaults to `true`; `false` keeps a durable queue around.
    pub fn auto_unsubscribe(mut self, auto_unsubscribe: bool) -> Self {
        self.auto_unsubscribe = auto_unsubscribe;
        self
    }

    /// Commit point for asynchronous subscriptions.
    pub fn commit_policy(mut self, commit: CommitPolicy) -> Self {
        self.commit = commit;
        self
    }

    /// Allow up to `n` callbacks to run concurrently. Gives up per-message
    /// ordering.
    pub fn max_in_flight(mut self, n: NonZeroUsize) -> Self {
        self.max_in_flight = n;
        self
    }

    pub fn topics(&self) -> &BTreeSet<String> {
        &self.topics
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn is_auto_unsubscribe(&self) -> bool {
        self.auto_unsubscribe
    }

    pub fn commit(&self) -> CommitPolicy {
        self.commit
    }

    pub fn in_flight_limit(&self) -> NonZeroUsize {
        self.max_in_flight
    }

    pub fn validate(&self) -> Result<(), InvalidSubscription> {
        if self.group.trim().is_empty() {
            return Err(InvalidSubscription::new(InvalidSubscriptionKind::EmptyGroup));
        }
        if self.topics.is_empty() {
            return Err(InvalidSubscription::new(InvalidSubscriptionKind::NoTopics));
        }
        if self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(InvalidSubscription::new(InvalidSubscriptionKind::EmptyTopic));
        }
        Ok(())
    }
}

/// Receives the events of one subscription.
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync + 'static {
    fn subscription(&self) -> Subscription;

    /// Handle one valid envelope. An error rejects the message (synchronous
    /// subscriptions) or schedules a retry (asynchronous ones).
    async fn on_event(&self, envelope: &Envelope) -> Result<(), tower::BoxError>;
}

/// Handler for one routed topic.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<(), tower::BoxError>;
}

#[async_trait::async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), tower::BoxError>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), tower::BoxError> {
        self(envelope).await
    }
}

/// Subscriber backed by a single handler.
pub struct FnSubscriber<H> {
    subscription: Subscription,
    handler: H,
}

impl<H: EventHandler> FnSubscriber<H> {
    pub fn new(subscription: Subscription, handler: H) -> Self {
        Self {
            subscription,
            handler,
        }
    }
}

#[async_trait::async_trait]
impl<H: EventHandler> Subscriber for FnSubscriber<H> {
    fn subscription(&self) -> Subscription {
        self.subscription.clone()
    }

    async fn on_event(&self, envelope: &Envelope) -> Result<(), tower::BoxError> {
        self.handler.handle(envelope.clone()).await
    }
}

/// Subscriber dispatching on the envelope type.
///
/// Routes are keyed by lower-cased topic. A route may be a wildcard pattern
/// (`*` one word, `#` any number of words); exact routes win over patterns.
/// Events nobody routes are logged and acknowledged.
pub struct TopicRouter {
    base: Subscription,
    routes: BTreeMap<String, Arc<dyn EventHandler>>,
}

impl TopicRouter {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            base: Subscription::new(group, Vec::<String>::new()),
            routes: BTreeMap::new(),
        }
    }

    /// Add or replace the handler of a topic.
    pub fn route(mut self, topic: impl AsRef<str>, handler: impl EventHandler) -> Self {
        self.routes
            .insert(topic.as_ref().to_lowercase(), Arc::new(handler));
        self
    }

    /// Adjust the dispatch settings; topics always come from the routes.
    pub fn configure(mut self, f: impl FnOnce(Subscription) -> Subscription) -> Self {
        self.base = f(self.base);
        self
    }

    fn handler_for(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.routes.get(event_type).or_else(|| {
            self.routes
                .iter()
                .find(|(pattern, _)| topic_matches(pattern, event_type))
                .map(|(_, handler)| handler)
        })
    }
}

#[async_trait::async_trait]
impl Subscriber for TopicRouter {
    fn subscription(&self) -> Subscription {
        let mut subscription = self.base.clone();
        subscription.topics = self.routes.keys().cloned().collect();
        subscription
    }

    async fn on_event(&self, envelope: &Envelope) -> Result<(), tower::BoxError> {
        let event_type = envelope.event_type().trim();
        if event_type.is_empty() {
            tracing::warn!(id = %envelope.id(), "No type found for the event");
            return Err("event type is required".into());
        }

        match self.handler_for(&event_type.to_lowercase()) {
            Some(handler) => handler.handle(envelope.clone()).await,
            None => {
                tracing::warn!(event_type, "No handler found for event type");
                Ok(())
            }
        }
    }
}

/// A subscription the host refuses to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSubscription {
    kind: InvalidSubscriptionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidSubscriptionKind {
    EmptyGroup,
    NoTopics,
    EmptyTopic,
}

impl InvalidSubscription {
    fn new(kind: InvalidSubscriptionKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> InvalidSubscriptionKind {
        self.kind
    }
}

impl std::fmt::Display for InvalidSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            InvalidSubscriptionKind::EmptyGroup => write!(f, "subscription group is required"),
            InvalidSubscriptionKind::NoTopics => write!(f, "subscription has no topics"),
            InvalidSubscriptionKind::EmptyTopic => write!(f, "subscription topic must not be empty"),
        }
    }
}

impl std::error::Error for InvalidSubscription {}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> impl EventHandler {
        let counter = Arc::clone(counter);
        move |_envelope: Envelope| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, tower::BoxError>(())
            }
        }
    }

    #[test]
    fn defaults() {
        let subscription = Subscription::new("billing", ["orders.*"]);
        assert!(!subscription.is_async());
        assert!(subscription.is_auto_unsubscribe());
        assert_eq!(subscription.commit(), CommitPolicy::BeforeProcess);
        assert_eq!(subscription.in_flight_limit().get(), 1);
        assert!(subscription.validate().is_ok());
    }

    #[test]
    fn rejects_incomplete_subscriptions() {
        assert_eq!(
            Subscription::new(" ", ["a"]).validate().unwrap_err().kind(),
            InvalidSubscriptionKind::EmptyGroup
        );
        assert_eq!(
            Subscription::new("g", Vec::<String>::new())
                .validate()
                .unwrap_err()
                .kind(),
            InvalidSubscriptionKind::NoTopics
        );
        assert_eq!(
            Subscription::new("g", ["a", ""]).validate().unwrap_err().kind(),
            InvalidSubscriptionKind::EmptyTopic
        );
    }

    #[tokio::test]
    async fn router_prefers_exact_route() {
        let exact = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));
        let router = TopicRouter::new("billing")
            .route("Orders.Created", counting(&exact))
            .route("orders.*", counting(&wildcard));

        router
            .on_event(&Envelope::builder("1", "ORDERS.CREATED").build())
            .await
            .unwrap();
        router
            .on_event(&Envelope::builder("2", "orders.updated").build())
            .await
            .unwrap();

        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 1);
        assert_eq!(
            router.subscription().topics().iter().collect::<Vec<_>>(),
            ["orders.*", "orders.created"]
        );
    }

    #[tokio::test]
    async fn router_acknowledges_unrouted_events() {
        let router = TopicRouter::new("billing").route("orders.created", |_: Envelope| async {
            Err::<(), tower::BoxError>("unreachable".into())
        });

        let result = router
            .on_event(&Envelope::builder("1", "users.created").build())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn router_fails_untyped_events() {
        let router = TopicRouter::new("billing");
        assert!(router.on_event(&Envelope::builder("1", "").build()).await.is_err());
    }

    #[test]
    fn router_keeps_dispatch_settings() {
        let subscription = TopicRouter::new("billing")
            .route("orders.created", |_: Envelope| async { Ok::<_, tower::BoxError>(()) })
            .configure(|s| s.asynchronous().auto_unsubscribe(false))
            .subscription();

        assert!(subscription.is_async());
        assert!(!subscription.is_auto_unsubscribe());
    }
}
