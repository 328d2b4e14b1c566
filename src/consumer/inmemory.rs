use std::{collections::HashSet, time::Duration};

use tokio::{sync::OnceCell, time::Instant};

use crate::{
    broker::{BrokerAddress, LogCallback, LogEvent, LogKind},
    consumer::{ConsumerClient, ConsumerClientFactory, ConsumerError, PollError, Received},
    pool::ConnectionError,
    transport::{InMemoryBroker, PollFault},
};

/// Creates [`InMemoryConsumer`]s bound to one [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryConsumerFactory {
    broker: InMemoryBroker,
}

impl InMemoryConsumerFactory {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait::async_trait]
impl ConsumerClientFactory for InMemoryConsumerFactory {
    type Client = InMemoryConsumer;

    async fn create(&self, group: &str, auto_unsubscribe: bool) -> Result<InMemoryConsumer, ConnectionError> {
        let client = InMemoryConsumer {
            broker: self.broker.clone(),
            group: group.to_owned(),
            auto_unsubscribe,
            connection: OnceCell::new(),
            unacked: HashSet::new(),
            log: None,
            log_id: None,
        };
        client.open().await?;
        Ok(client)
    }
}

/// Consumer client of the in-memory broker.
///
/// The group names a queue on the broker; subscribing binds topic patterns to
/// it. Deliveries held at dispose time are requeued.
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group: String,
    auto_unsubscribe: bool,
    connection: OnceCell<()>,
    unacked: HashSet<u64>,
    log: Option<LogCallback>,
    log_id: Option<u64>,
}

impl InMemoryConsumer {
    pub fn auto_unsubscribe(&self) -> bool {
        self.auto_unsubscribe
    }

    async fn open(&self) -> Result<(), ConnectionError> {
        self.connection
            .get_or_try_init(|| async {
                self.broker.connect().map_err(|e| {
                    ConnectionError::new(self.broker.address(), Box::new(e))
                })?;
                self.broker.declare(&self.group);
                Ok(())
            })
            .await
            .map(|_| ())
    }

    fn ensure_connected(&self) -> Result<(), ConsumerError> {
        if self.connection.initialized() {
            Ok(())
        } else {
            Err(ConsumerError::not_connected())
        }
    }

    fn report(&self, kind: LogKind, reason: impl Into<String>) {
        if let Some(log) = &self.log {
            log(LogEvent::new(kind, reason));
        }
    }
}

#[async_trait::async_trait]
impl ConsumerClient for InMemoryConsumer {
    type Delivery = u64;

    fn broker_address(&self) -> BrokerAddress {
        self.broker.address()
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn on_log(&mut self, callback: LogCallback) {
        if let Some(id) = self.log_id.take() {
            self.broker.unregister_log(&self.group, id);
        }
        self.log_id = Some(self.broker.register_log(&self.group, callback.clone()));
        self.log = Some(callback);
    }

    async fn connect(&self) -> Result<(), ConsumerError> {
        Ok(self.open().await?)
    }

    async fn subscribe(&mut self, topics: &[String]) -> Result<(), ConsumerError> {
        self.ensure_connected()?;
        self.broker.bind(&self.group, topics);
        self.report(LogKind::ConsumerRegistered, self.group.clone());
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Received<u64>>, PollError> {
        self.ensure_connected().map_err(PollError::Fatal)?;
        let deadline = Instant::now() + timeout;
        // A requeued delivery is ready again at once; yield so a reject loop
        // cannot starve other tasks.
        tokio::task::yield_now().await;

        loop {
            let notified = self.broker.notify().notified();
            match self.broker.take(&self.group) {
                Ok(Some((tag, message))) => {
                    self.unacked.insert(tag);
                    return Ok(Some(Received {
                        message,
                        delivery: tag,
                    }));
                }
                Ok(None) => {}
                Err(PollFault::Retriable(reason)) => return Err(PollError::Retriable(reason)),
                Err(PollFault::Fatal(reason)) => {
                    return Err(PollError::Fatal(ConsumerError::broker(reason)));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, delivery: u64) -> Result<(), ConsumerError> {
        self.unacked.remove(&delivery);
        if !self.broker.ack(&self.group, delivery) {
            self.report(LogKind::MessageNotInflight, format!("delivery {delivery}"));
        }
        Ok(())
    }

    async fn reject(&mut self, delivery: u64) -> Result<(), ConsumerError> {
        self.unacked.remove(&delivery);
        if !self.broker.nack(&self.group, delivery) {
            self.report(LogKind::MessageNotInflight, format!("delivery {delivery}"));
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, topics: &[String]) -> Result<(), ConsumerError> {
        self.ensure_connected()?;
        self.broker.unbind(&self.group, topics);
        self.report(LogKind::ConsumerUnregistered, self.group.clone());
        Ok(())
    }

    async fn dispose(&mut self) {
        self.broker
            .release(&self.group, std::mem::take(&mut self.unacked));
        if let Some(id) = self.log_id.take() {
            self.broker.unregister_log(&self.group, id);
        }
        self.log = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        Envelope,
        consumer::{Disposition, ListenContext, ListenOptions, MessageHandler},
        envelope::codec::{CloudEventsCodec, ContentMode, EnvelopeCodec},
    };

    fn publish(broker: &InMemoryBroker, id: &str, topic: &str) {
        let envelope = Envelope::builder(id, topic).json(b"{}".to_vec()).build();
        broker.publish(CloudEventsCodec.encode(&envelope, ContentMode::Binary).unwrap());
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let broker = InMemoryBroker::new();
        let client = InMemoryConsumerFactory::new(broker.clone())
            .create("billing", true)
            .await
            .unwrap();

        let (a, b) = tokio::join!(client.connect(), client.connect());
        a.unwrap();
        b.unwrap();

        assert_eq!(broker.connections_opened(), 1);
    }

    #[tokio::test]
    async fn unreachable_broker_fails_creation() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true);

        let err = InMemoryConsumerFactory::new(broker)
            .create("billing", true)
            .await
            .err()
            .unwrap();

        assert_eq!(err.broker_address().name(), "InMemory");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_poll_times_out() {
        let broker = InMemoryBroker::new();
        let mut client = InMemoryConsumerFactory::new(broker)
            .create("billing", true)
            .await
            .unwrap();
        client.subscribe(&["orders.*".to_owned()]).await.unwrap();

        let started = Instant::now();
        let polled = client.poll(Duration::from_secs(1)).await.unwrap();

        assert!(polled.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn poll_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let mut client = InMemoryConsumerFactory::new(broker.clone())
            .create("billing", true)
            .await
            .unwrap();
        client.subscribe(&["orders.*".to_owned()]).await.unwrap();

        let publisher = async {
            tokio::task::yield_now().await;
            publish(&broker, "1", "orders.created");
        };
        let (polled, ()) = tokio::join!(client.poll(Duration::from_secs(30)), publisher);

        let received = polled.unwrap().unwrap();
        assert_eq!(received.message.topic, "orders.created");
        assert_eq!(broker.stats("billing").unacked, 1);
    }

    #[tokio::test]
    async fn dispose_requeues_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        let factory = InMemoryConsumerFactory::new(broker.clone());
        let mut client = factory.create("billing", true).await.unwrap();
        client.subscribe(&["orders.created".to_owned()]).await.unwrap();
        publish(&broker, "1", "orders.created");

        let first = client.poll(Duration::from_secs(1)).await.unwrap().unwrap();
        client.dispose().await;
        assert_eq!(broker.stats("billing").ready, 1);

        let mut next = factory.create("billing", true).await.unwrap();
        let again = next.poll(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(again.delivery, first.delivery);
    }

    #[tokio::test]
    async fn broker_log_events_reach_the_client_callback() {
        let broker = InMemoryBroker::new();
        let mut client = InMemoryConsumerFactory::new(broker.clone())
            .create("billing", true)
            .await
            .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        client.on_log(Arc::new(move |event: LogEvent| sink.lock().push(event.kind)));

        broker.emit_log("billing", LogEvent::new(LogKind::ServerConnError, "reset"));
        client.dispose().await;
        broker.emit_log("billing", LogEvent::new(LogKind::ServerConnError, "reset"));

        assert_eq!(*events.lock(), [LogKind::ServerConnError]);
    }

    struct RejectOnce {
        rejected: Mutex<bool>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl MessageHandler for RejectOnce {
        async fn handle(&self, envelope: Envelope) -> Disposition {
            self.seen.lock().push(envelope.id().to_owned());
            let mut rejected = self.rejected.lock();
            if *rejected {
                Disposition::Commit
            } else {
                *rejected = true;
                Disposition::Reject
            }
        }
    }

    #[tokio::test]
    async fn rejected_message_is_redelivered_through_listen() {
        let broker = InMemoryBroker::new();
        let mut client = InMemoryConsumerFactory::new(broker.clone())
            .create("billing", true)
            .await
            .unwrap();
        client.subscribe(&["orders.*".to_owned()]).await.unwrap();
        publish(&broker, "1", "orders.created");

        let handler = RejectOnce {
            rejected: Mutex::new(false),
            seen: Mutex::new(Vec::new()),
        };
        let log: LogCallback = Arc::new(|_| {});
        let cancel = CancellationToken::new();
        let ctx = ListenContext {
            options: ListenOptions::default().with_poll_timeout(Duration::from_millis(10)),
            codec: &CloudEventsCodec,
            handler: &handler,
            log: &log,
            enricher: None,
        };

        let stopper = async {
            while broker.stats("billing").committed == 0 {
                tokio::task::yield_now().await;
            }
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(client.listen(ctx, &cancel), stopper);

        result.unwrap();
        assert_eq!(*handler.seen.lock(), ["1", "1"]);
        let stats = broker.stats("billing");
        assert_eq!((stats.committed, stats.rejected, stats.ready), (1, 1, 0));
    }
}
