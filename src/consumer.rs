//! Receive path: broker-specific consumer clients and the listen loop.
//!
//! A [`ConsumerClient`] is one subscription's handle on the broker. It moves
//! through `connect → fetch_topics → subscribe → listen → unsubscribe /
//! dispose`, and is never shared between subscriptions. Clients are created
//! per session by a [`ConsumerClientFactory`].
//!
//! Drivers only implement the primitive operations. The blocking
//! [`listen`](ConsumerClient::listen) loop is shared: it polls, decodes,
//! stamps the consumer group (and any enriched headers) on the envelope,
//! hands it to a [`MessageHandler`] and settles the delivery with the
//! handler's [`Disposition`].
//!
//! Poll failures come in two flavours. [`PollError::Retriable`] is reported
//! as a [`LogKind::ConsumeRetry`] event and polling continues;
//! [`PollError::Fatal`] ends the loop with an error so the supervisor can
//! start a fresh session.

pub mod inmemory;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use futures::{StreamExt, future::BoxFuture, stream::FuturesUnordered};
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    broker::{BrokerAddress, LogCallback, LogEvent, LogKind},
    envelope::{
        GROUP_HEADER,
        codec::{EncodedMessage, EnvelopeCodec},
    },
    pool::ConnectionError,
};

pub use inmemory::{InMemoryConsumer, InMemoryConsumerFactory};

/// Per-message header enrichment applied after decoding.
pub type HeaderEnricher = Arc<dyn Fn(&EncodedMessage) -> Vec<(String, String)> + Send + Sync>;

/// One message taken from the broker.
#[derive(Debug)]
pub struct Received<D> {
    pub message: EncodedMessage,
    /// Opaque handle needed to commit or reject the message.
    pub delivery: D,
}

/// Failure of a single poll.
#[derive(Debug)]
pub enum PollError {
    /// Transient broker condition. Logged, then polling continues.
    Retriable(String),
    /// Anything else. Ends the listen session.
    Fatal(ConsumerError),
}

/// What to do with a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processing finished; advance the broker-side position.
    Commit,
    /// Processing failed; make the message eligible for redelivery.
    Reject,
}

/// Receives decoded envelopes from the listen loop.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Disposition;
}

/// Tuning of the listen loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenOptions {
    /// Longest single wait for the next message.
    pub poll_timeout: Duration,
    /// Handler invocations allowed to run at once. Above 1, messages are
    /// settled in completion order rather than arrival order.
    pub max_in_flight: NonZeroUsize,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            max_in_flight: NonZeroUsize::MIN,
        }
    }
}

impl ListenOptions {
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: NonZeroUsize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }
}

/// Everything the listen loop needs besides the client itself.
#[derive(Clone, Copy)]
pub struct ListenContext<'a> {
    pub options: ListenOptions,
    pub codec: &'a dyn EnvelopeCodec,
    pub handler: &'a dyn MessageHandler,
    pub log: &'a LogCallback,
    pub enricher: Option<&'a HeaderEnricher>,
}

/// One subscription's connection to a broker.
#[async_trait::async_trait]
pub trait ConsumerClient: Send + Sync {
    /// Broker-specific handle identifying one received message.
    type Delivery: Send + 'static;

    fn broker_address(&self) -> BrokerAddress;

    /// Consumer group (Kafka) or queue name (RabbitMQ).
    fn group(&self) -> &str;

    /// Install the receiver of operational events.
    fn on_log(&mut self, callback: LogCallback);

    /// Establish the broker connection. Idempotent: concurrent and repeated
    /// calls share one underlying connection.
    async fn connect(&self) -> Result<(), ConsumerError>;

    /// Make sure the given topics exist and return the names to subscribe
    /// with. Creation problems are reported through the log callback, never
    /// as an error.
    async fn fetch_topics(&mut self, names: &[String]) -> Result<Vec<String>, ConsumerError> {
        Ok(names.to_vec())
    }

    async fn subscribe(&mut self, topics: &[String]) -> Result<(), ConsumerError>;

    /// Wait up to `timeout` for the next message.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Received<Self::Delivery>>, PollError>;

    async fn commit(&mut self, delivery: Self::Delivery) -> Result<(), ConsumerError>;

    async fn reject(&mut self, delivery: Self::Delivery) -> Result<(), ConsumerError>;

    async fn unsubscribe(&mut self, topics: &[String]) -> Result<(), ConsumerError>;

    /// Release broker-side and local resources. Never fails.
    async fn dispose(&mut self);

    /// Poll and dispatch until `cancel` fires or polling fails fatally.
    ///
    /// Returns `Ok` only on cancellation. Handlers still running when the loop
    /// stops are awaited and their deliveries settled.
    async fn listen(
        &mut self,
        ctx: ListenContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumerError> {
        run_listen_loop(self, ctx, cancel).await
    }
}

/// Creates one consumer client per listen session.
#[async_trait::async_trait]
pub trait ConsumerClientFactory: Send + Sync + 'static {
    type Client: ConsumerClient + 'static;

    /// Create a connected client. Fails when the broker is unreachable.
    async fn create(&self, group: &str, auto_unsubscribe: bool) -> Result<Self::Client, ConnectionError>;
}

type InFlight<'a, D> = FuturesUnordered<BoxFuture<'a, (D, Disposition)>>;

#[tracing::instrument(skip_all, fields(group = %client.group()))]
async fn run_listen_loop<C>(
    client: &mut C,
    ctx: ListenContext<'_>,
    cancel: &CancellationToken,
) -> Result<(), ConsumerError>
where
    C: ConsumerClient + ?Sized,
{
    client.connect().await?;

    let group = client.group().to_owned();
    let limit = ctx.options.max_in_flight.get();
    let mut in_flight: InFlight<'_, C::Delivery> = FuturesUnordered::new();

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            Some((delivery, disposition)) = in_flight.next(), if !in_flight.is_empty() => {
                if let Err(err) = settle(client, delivery, disposition).await {
                    break Err(err);
                }
            }
            polled = client.poll(ctx.options.poll_timeout), if in_flight.len() < limit => {
                let received = match polled {
                    Ok(Some(received)) => received,
                    Ok(None) => continue,
                    Err(PollError::Retriable(reason)) => {
                        (ctx.log)(LogEvent::new(LogKind::ConsumeRetry, reason));
                        continue;
                    }
                    Err(PollError::Fatal(err)) => break Err(err),
                };

                match ctx.codec.decode(&received.message) {
                    Ok(envelope) => {
                        let mut envelope = envelope.with_header(GROUP_HEADER, group.as_str());
                        if let Some(enricher) = ctx.enricher {
                            envelope = envelope.with_headers(enricher(&received.message));
                        }
                        let handler = ctx.handler;
                        let delivery = received.delivery;
                        in_flight.push(Box::pin(async move {
                            (delivery, handler.handle(envelope).await)
                        }));
                    }
                    Err(err) => {
                        tracing::error!(
                            topic = %received.message.topic,
                            error = %err,
                            "Undecodable message discarded",
                        );
                        if let Err(err) = client.commit(received.delivery).await {
                            break Err(err);
                        }
                    }
                }
            }
        }
    };

    while let Some((delivery, disposition)) = in_flight.next().await {
        if let Err(err) = settle(client, delivery, disposition).await {
            tracing::warn!(error = %err, "Could not settle delivery after listen stopped");
        }
    }

    outcome
}

async fn settle<C>(client: &mut C, delivery: C::Delivery, disposition: Disposition) -> Result<(), ConsumerError>
where
    C: ConsumerClient + ?Sized,
{
    match disposition {
        Disposition::Commit => client.commit(delivery).await,
        Disposition::Reject => client.reject(delivery).await,
    }
}

/// Error returned by consumer client operations.
#[derive(Debug)]
pub struct ConsumerError {
    context: SpanTrace,
    kind: ConsumerErrorKind,
}

/// Consumer errors kind.
#[derive(Debug)]
pub enum ConsumerErrorKind {
    /// The broker could not be reached.
    Connection(ConnectionError),
    /// An operation that needs a connection ran before `connect`.
    NotConnected,
    /// Errors reported by the broker client library.
    Broker(tower::BoxError),
}

impl ConsumerError {
    fn new(kind: ConsumerErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn broker(err: impl Into<tower::BoxError>) -> Self {
        Self::new(ConsumerErrorKind::Broker(err.into()))
    }

    pub fn not_connected() -> Self {
        Self::new(ConsumerErrorKind::NotConnected)
    }

    pub fn kind(&self) -> &ConsumerErrorKind {
        &self.kind
    }
}

impl From<ConnectionError> for ConsumerError {
    fn from(err: ConnectionError) -> Self {
        Self::new(ConsumerErrorKind::Connection(err))
    }
}

impl std::fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumerErrorKind::Connection(err) => {
                writeln!(f, "Connection error: broker {} unreachable", err.broker_address())
            }
            ConsumerErrorKind::NotConnected => writeln!(f, "Consumer client is not connected"),
            ConsumerErrorKind::Broker(err) => writeln!(f, "Broker error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumerErrorKind::Connection(err) => Some(err),
            ConsumerErrorKind::NotConnected => None,
            ConsumerErrorKind::Broker(err) => Some(err.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;
    use crate::envelope::codec::{CloudEventsCodec, ContentMode};

    type Script = VecDeque<Result<Option<Received<u32>>, PollError>>;

    /// Client replaying scripted polls. Cancels `done` once the script runs out.
    struct Scripted {
        polls: Script,
        done: CancellationToken,
        committed: Vec<u32>,
        rejected: Vec<u32>,
    }

    impl Scripted {
        fn new(polls: Script, done: &CancellationToken) -> Self {
            Self {
                polls,
                done: done.clone(),
                committed: Vec::new(),
                rejected: Vec::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl ConsumerClient for Scripted {
        type Delivery = u32;

        fn broker_address(&self) -> BrokerAddress {
            BrokerAddress::new("Scripted", None)
        }

        fn group(&self) -> &str {
            "billing"
        }

        fn on_log(&mut self, _callback: LogCallback) {}

        async fn connect(&self) -> Result<(), ConsumerError> {
            Ok(())
        }

        async fn subscribe(&mut self, _topics: &[String]) -> Result<(), ConsumerError> {
            Ok(())
        }

        async fn poll(&mut self, _timeout: Duration) -> Result<Option<Received<u32>>, PollError> {
            match self.polls.pop_front() {
                Some(next) => next,
                None => {
                    self.done.cancel();
                    Ok(None)
                }
            }
        }

        async fn commit(&mut self, delivery: u32) -> Result<(), ConsumerError> {
            self.committed.push(delivery);
            Ok(())
        }

        async fn reject(&mut self, delivery: u32) -> Result<(), ConsumerError> {
            self.rejected.push(delivery);
            Ok(())
        }

        async fn unsubscribe(&mut self, _topics: &[String]) -> Result<(), ConsumerError> {
            Ok(())
        }

        async fn dispose(&mut self) {}
    }

    /// Commits everything except envelopes whose id starts with `bad`.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Envelope>>,
    }

    #[async_trait::async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, envelope: Envelope) -> Disposition {
            let disposition = if envelope.id().starts_with("bad") {
                Disposition::Reject
            } else {
                Disposition::Commit
            };
            self.seen.lock().push(envelope);
            disposition
        }
    }

    fn delivery(tag: u32, id: &str) -> Result<Option<Received<u32>>, PollError> {
        let envelope = Envelope::builder(id, "orders.created")
            .json(br#"{"id":1}"#.to_vec())
            .build();
        Ok(Some(Received {
            message: CloudEventsCodec.encode(&envelope, ContentMode::Binary).unwrap(),
            delivery: tag,
        }))
    }

    fn recording_log() -> (LogCallback, Arc<Mutex<Vec<LogEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (Arc::new(move |event: LogEvent| sink.lock().push(event)), events)
    }

    #[tokio::test]
    async fn retriable_poll_error_is_logged_and_skipped() {
        let cancel = CancellationToken::new();
        let mut client = Scripted::new(
            VecDeque::from([
                Err(PollError::Retriable("coordinator loading".into())),
                Ok(None),
                delivery(7, "ok-1"),
            ]),
            &cancel,
        );
        let handler = Recorder::default();
        let (log, events) = recording_log();
        let ctx = ListenContext {
            options: ListenOptions::default(),
            codec: &CloudEventsCodec,
            handler: &handler,
            log: &log,
            enricher: None,
        };

        client.listen(ctx, &cancel).await.unwrap();

        assert_eq!(client.committed, [7]);
        assert_eq!(handler.seen.lock().len(), 1);
        assert_eq!(
            *events.lock(),
            [LogEvent::new(LogKind::ConsumeRetry, "coordinator loading")]
        );
    }

    #[tokio::test]
    async fn handler_outcome_decides_commit_or_reject() {
        let cancel = CancellationToken::new();
        let mut client = Scripted::new(
            VecDeque::from([delivery(1, "ok-1"), delivery(2, "bad-1"), delivery(3, "ok-2")]),
            &cancel,
        );
        let handler = Recorder::default();
        let (log, _) = recording_log();
        let ctx = ListenContext {
            options: ListenOptions::default(),
            codec: &CloudEventsCodec,
            handler: &handler,
            log: &log,
            enricher: None,
        };

        client.listen(ctx, &cancel).await.unwrap();

        assert_eq!(client.committed, [1, 3]);
        assert_eq!(client.rejected, [2]);
    }

    #[tokio::test]
    async fn undecodable_message_is_committed_without_dispatch() {
        let cancel = CancellationToken::new();
        let garbage = Received {
            message: EncodedMessage {
                topic: "orders.created".into(),
                body: "not an event".into(),
                ..Default::default()
            },
            delivery: 9,
        };
        let mut client = Scripted::new(VecDeque::from([Ok(Some(garbage))]), &cancel);
        let handler = Recorder::default();
        let (log, _) = recording_log();
        let ctx = ListenContext {
            options: ListenOptions::default(),
            codec: &CloudEventsCodec,
            handler: &handler,
            log: &log,
            enricher: None,
        };

        client.listen(ctx, &cancel).await.unwrap();

        assert_eq!(client.committed, [9]);
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn group_and_enriched_headers_are_attached() {
        let cancel = CancellationToken::new();
        let mut client = Scripted::new(VecDeque::from([delivery(1, "ok-1")]), &cancel);
        let handler = Recorder::default();
        let (log, _) = recording_log();
        let enricher: HeaderEnricher =
            Arc::new(|message: &EncodedMessage| vec![("x-topic".to_owned(), message.topic.clone())]);
        let ctx = ListenContext {
            options: ListenOptions::default(),
            codec: &CloudEventsCodec,
            handler: &handler,
            log: &log,
            enricher: Some(&enricher),
        };

        client.listen(ctx, &cancel).await.unwrap();

        let seen = handler.seen.lock();
        assert_eq!(seen[0].group(), Some("billing"));
        assert_eq!(seen[0].header("X-Topic"), Some("orders.created"));
    }

    #[tokio::test]
    async fn fatal_poll_error_ends_listen() {
        let cancel = CancellationToken::new();
        let mut client = Scripted::new(
            VecDeque::from([
                delivery(1, "ok-1"),
                Err(PollError::Fatal(ConsumerError::broker("broker gone"))),
                delivery(2, "ok-2"),
            ]),
            &cancel,
        );
        let handler = Recorder::default();
        let (log, _) = recording_log();
        let ctx = ListenContext {
            options: ListenOptions::default(),
            codec: &CloudEventsCodec,
            handler: &handler,
            log: &log,
            enricher: None,
        };

        let err = client.listen(ctx, &cancel).await.unwrap_err();

        assert!(matches!(err.kind(), ConsumerErrorKind::Broker(_)));
        assert_eq!(client.committed, [1]);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_listen_returns_ok() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut client = Scripted::new(VecDeque::from([delivery(1, "ok-1")]), &cancel);
        let handler = Recorder::default();
        let (log, _) = recording_log();
        let ctx = ListenContext {
            options: ListenOptions::default(),
            codec: &CloudEventsCodec,
            handler: &handler,
            log: &log,
            enricher: None,
        };

        client.listen(ctx, &cancel).await.unwrap();

        assert!(client.committed.is_empty());
        assert_eq!(client.polls.len(), 1);
    }

    /// Holds every envelope until `release` fires, tracking peak concurrency.
    struct Gate {
        release: CancellationToken,
        running: Mutex<(usize, usize)>,
    }

    #[async_trait::async_trait]
    impl MessageHandler for Gate {
        async fn handle(&self, _envelope: Envelope) -> Disposition {
            {
                let mut running = self.running.lock();
                running.0 += 1;
                running.1 = running.1.max(running.0);
            }
            self.release.cancelled().await;
            self.running.lock().0 -= 1;
            Disposition::Commit
        }
    }

    #[tokio::test]
    async fn in_flight_handlers_are_capped() {
        let cancel = CancellationToken::new();
        let gate = Gate {
            release: CancellationToken::new(),
            running: Mutex::new((0, 0)),
        };
        let mut client = Scripted::new(
            (1..=5).map(|tag| delivery(tag, "ok")).collect(),
            &cancel,
        );
        let (log, _) = recording_log();
        let ctx = ListenContext {
            options: ListenOptions::default().with_max_in_flight(NonZeroUsize::new(3).unwrap()),
            codec: &CloudEventsCodec,
            handler: &gate,
            log: &log,
            enricher: None,
        };

        let release = gate.release.clone();
        let opener = async {
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            release.cancel();
        };
        let (result, ()) = tokio::join!(client.listen(ctx, &cancel), opener);

        result.unwrap();
        assert_eq!(gate.running.lock().1, 3);
        let mut committed = client.committed.clone();
        committed.sort_unstable();
        assert_eq!(committed, [1, 2, 3, 4, 5]);
    }
}
