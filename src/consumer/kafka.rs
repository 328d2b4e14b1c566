use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use rdkafka::{
    ClientContext, Offset, TopicPartitionList,
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    message::{Headers, Message, OwnedMessage},
};
use tokio::sync::OnceCell;

use crate::{
    broker::{BrokerAddress, LogCallback, LogEvent, LogKind},
    consumer::{ConsumerClient, ConsumerClientFactory, ConsumerError, PollError, Received},
    envelope::codec::EncodedMessage,
    pool::ConnectionError,
    transport::kafka::KafkaOptions,
};

/// Creates one [`KafkaConsumer`] per session.
#[derive(Debug, Clone)]
pub struct KafkaConsumerFactory {
    options: KafkaOptions,
}

impl KafkaConsumerFactory {
    pub fn new(options: KafkaOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ConsumerClientFactory for KafkaConsumerFactory {
    type Client = KafkaConsumer;

    async fn create(&self, group: &str, _auto_unsubscribe: bool) -> Result<KafkaConsumer, ConnectionError> {
        let client = KafkaConsumer::new(group, self.options.clone());
        client.open().await?;
        Ok(client)
    }
}

/// Position of one consumed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaDelivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Forwards librdkafka client errors to the installed log callback.
#[derive(Clone, Default)]
pub struct KafkaContext {
    log: Arc<RwLock<Option<LogCallback>>>,
}

impl ClientContext for KafkaContext {
    fn error(&self, error: KafkaError, reason: &str) {
        tracing::warn!(%error, reason, "Kafka client error");
        if let Some(log) = self.log.read().as_ref() {
            log(LogEvent::new(
                LogKind::ServerConnError,
                format!("An error occurred during connect kafka --> {reason}"),
            ));
        }
    }
}

impl ConsumerContext for KafkaContext {}

/// Kafka consumer-group member.
///
/// The underlying [`StreamConsumer`] is created lazily on first connect and
/// shared by every later call. Offsets are committed explicitly, one past the
/// processed record; a rejected record is sought back to so it is consumed
/// again.
pub struct KafkaConsumer {
    group: String,
    options: KafkaOptions,
    context: KafkaContext,
    consumer: OnceCell<StreamConsumer<KafkaContext>>,
}

impl KafkaConsumer {
    pub fn new(group: impl Into<String>, options: KafkaOptions) -> Self {
        Self {
            group: group.into(),
            options,
            context: KafkaContext::default(),
            consumer: OnceCell::new(),
        }
    }

    async fn open(&self) -> Result<&StreamConsumer<KafkaContext>, ConnectionError> {
        self.consumer
            .get_or_try_init(|| async {
                tracing::debug!(group = %self.group, "Creating Kafka consumer");
                self.options
                    .client_config(&[
                        ("group.id", self.group.as_str()),
                        ("auto.offset.reset", "earliest"),
                        ("allow.auto.create.topics", "true"),
                        ("enable.auto.commit", "false"),
                        ("log.connection.close", "false"),
                    ])
                    .create_with_context(self.context.clone())
                    .map_err(|e| ConnectionError::new(self.options.broker_address(), Box::new(e)))
            })
            .await
    }

    fn consumer(&self) -> Result<&StreamConsumer<KafkaContext>, ConsumerError> {
        self.consumer.get().ok_or_else(ConsumerError::not_connected)
    }

    fn report(&self, kind: LogKind, reason: impl Into<String>) {
        if let Some(log) = self.context.log.read().as_ref() {
            log(LogEvent::new(kind, reason));
        }
    }

    async fn create_topics(&self, names: &[String]) -> Result<(), KafkaError> {
        let admin: AdminClient<DefaultClientContext> = self.options.client_config(&[]).create()?;
        let topics: Vec<NewTopic<'_>> = names
            .iter()
            .map(|name| {
                NewTopic::new(
                    name,
                    self.options.topic_partitions,
                    TopicReplication::Fixed(self.options.topic_replication),
                )
            })
            .collect();

        for result in admin.create_topics(&topics, &AdminOptions::new()).await? {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((topic, code)) => {
                    tracing::debug!(topic, ?code, "Topic creation failed");
                    return Err(KafkaError::AdminOp(code));
                }
            }
        }
        Ok(())
    }
}

/// Translate a `*` / `#` pattern into the anchored regex librdkafka expects.
/// Plain names are returned unchanged.
fn subscription_name(topic: &str) -> String {
    if !topic.contains(['*', '#']) {
        return topic.to_owned();
    }
    let mut regex = String::from("^");
    for c in topic.chars() {
        match c {
            '*' => regex.push_str("[0-9a-zA-Z_-]+"),
            '#' => regex.push_str("[0-9a-zA-Z_.-]*"),
            '.' => regex.push_str("\\."),
            c => regex.push(c),
        }
    }
    regex.push('$');
    regex
}

#[async_trait]
impl ConsumerClient for KafkaConsumer {
    type Delivery = KafkaDelivery;

    fn broker_address(&self) -> BrokerAddress {
        self.options.broker_address()
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn on_log(&mut self, callback: LogCallback) {
        *self.context.log.write() = Some(callback);
    }

    async fn connect(&self) -> Result<(), ConsumerError> {
        self.open().await?;
        Ok(())
    }

    /// Create missing topics. Pattern subscriptions are never created.
    async fn fetch_topics(&mut self, names: &[String]) -> Result<Vec<String>, ConsumerError> {
        let subscriptions: Vec<String> = names.iter().map(|n| subscription_name(n)).collect();
        let concrete: Vec<String> = subscriptions
            .iter()
            .filter(|name| !name.starts_with('^'))
            .cloned()
            .collect();

        if !concrete.is_empty() {
            if let Err(err) = self.create_topics(&concrete).await {
                self.report(
                    LogKind::ConsumeError,
                    format!("An error was encountered when automatically creating topic! --> {err}"),
                );
            }
        }
        Ok(subscriptions)
    }

    async fn subscribe(&mut self, topics: &[String]) -> Result<(), ConsumerError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer()?
            .subscribe(&topics)
            .map_err(ConsumerError::broker)
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Received<KafkaDelivery>>, PollError> {
        let consumer = self.consumer().map_err(PollError::Fatal)?;
        let message = match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_elapsed) => return Ok(None),
            Ok(Ok(message)) => message.detach(),
            Ok(Err(KafkaError::PartitionEOF(_))) => return Ok(None),
            Ok(Err(err)) => {
                let retriable = err
                    .rdkafka_error_code()
                    .is_some_and(|code| self.options.retriable_error_codes.contains(&code));
                return Err(if retriable {
                    PollError::Retriable(err.to_string())
                } else {
                    PollError::Fatal(ConsumerError::broker(err))
                });
            }
        };

        Ok(Some(Received {
            delivery: KafkaDelivery {
                topic: message.topic().to_owned(),
                partition: message.partition(),
                offset: message.offset(),
            },
            message: encoded_message(&message),
        }))
    }

    async fn commit(&mut self, delivery: KafkaDelivery) -> Result<(), ConsumerError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &delivery.topic,
                delivery.partition,
                Offset::Offset(delivery.offset + 1),
            )
            .map_err(ConsumerError::broker)?;
        self.consumer()?
            .commit(&offsets, CommitMode::Async)
            .map_err(ConsumerError::broker)
    }

    async fn reject(&mut self, delivery: KafkaDelivery) -> Result<(), ConsumerError> {
        self.consumer()?
            .seek(
                &delivery.topic,
                delivery.partition,
                Offset::Offset(delivery.offset),
                Duration::from_secs(5),
            )
            .map_err(ConsumerError::broker)
    }

    async fn unsubscribe(&mut self, _topics: &[String]) -> Result<(), ConsumerError> {
        self.consumer()?.unsubscribe();
        Ok(())
    }

    async fn dispose(&mut self) {
        *self.context.log.write() = None;
        if self.consumer.take().is_some() {
            tracing::debug!(group = %self.group, "Kafka consumer closed");
        }
    }
}

/// Wire view of a record. A null payload becomes an empty body, so the codec
/// decides whether the record is a data-less event or undecodable.
fn encoded_message(message: &OwnedMessage) -> EncodedMessage {
    let body = match message.payload() {
        Some(payload) => payload.to_vec(),
        None => {
            tracing::debug!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                "Record without payload"
            );
            Vec::new()
        }
    };

    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|header| {
                    let value = header.value?;
                    Some((
                        header.key.to_ascii_lowercase(),
                        String::from_utf8_lossy(value).into_owned(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    EncodedMessage {
        topic: message.topic().to_owned(),
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        headers,
        body: body.into(),
    }
}
