use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use rdkafka::{
    ClientConfig,
    error::RDKafkaErrorCode,
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};

use crate::{
    broker::BrokerAddress,
    envelope::codec::{ContentMode, EncodedMessage},
    pool::ManageConnection,
    transport::{DeliveryStatus, Sender},
};

/// Kafka connection settings shared by senders and consumer clients.
#[derive(Debug, Clone)]
pub struct KafkaOptions {
    /// Bootstrap servers, `host:port[,host:port]`.
    pub servers: String,
    /// Raw librdkafka properties. Take precedence over every default below.
    pub main_config: HashMap<String, String>,
    /// Poll errors that are logged and retried instead of ending the session.
    pub retriable_error_codes: Vec<RDKafkaErrorCode>,
    /// Partitions of auto-created topics.
    pub topic_partitions: i32,
    /// Replication factor of auto-created topics.
    pub topic_replication: i32,
}

impl KafkaOptions {
    pub fn new(servers: impl Into<String>) -> Self {
        Self {
            servers: servers.into(),
            main_config: HashMap::new(),
            retriable_error_codes: vec![RDKafkaErrorCode::CoordinatorLoadInProgress],
            topic_partitions: 1,
            topic_replication: 1,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.main_config.insert(key.into(), value.into());
        self
    }

    pub fn with_retriable_error_code(mut self, code: RDKafkaErrorCode) -> Self {
        self.retriable_error_codes.push(code);
        self
    }

    pub fn with_topic_layout(mut self, partitions: i32, replication: i32) -> Self {
        self.topic_partitions = partitions;
        self.topic_replication = replication;
        self
    }

    pub fn broker_address(&self) -> BrokerAddress {
        BrokerAddress::new("Kafka", Some(self.servers.clone()))
    }

    /// Base client configuration: defaults first, then `main_config`.
    pub(crate) fn client_config(&self, defaults: &[(&str, &str)]) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.servers);
        for (key, value) in defaults {
            config.set(*key, *value);
        }
        for (key, value) in &self.main_config {
            config.set(key, value);
        }
        config
    }
}

/// Pool manager creating one [`FutureProducer`] per pooled handle.
#[derive(Debug, Clone)]
pub struct KafkaConnector {
    options: KafkaOptions,
    timeout: Duration,
}

impl KafkaConnector {
    /// Default send timeout is 5 seconds.
    pub fn new(options: KafkaOptions) -> Self {
        Self {
            options,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set a custom timeout for sending messages.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ManageConnection for KafkaConnector {
    type Connection = Kafka;
    type Error = rdkafka::error::KafkaError;

    fn broker_address(&self) -> BrokerAddress {
        self.options.broker_address()
    }

    async fn connect(&self) -> Result<Kafka, Self::Error> {
        let timeout_ms = self.timeout.as_millis().to_string();
        let producer: FutureProducer = self
            .options
            .client_config(&[
                ("message.timeout.ms", timeout_ms.as_str()),
                ("queue.buffering.max.messages", "10"),
                ("request.timeout.ms", "3000"),
            ])
            .create()?;
        Ok(Kafka {
            producer,
            timeout: self.timeout,
        })
    }
}

/// Kafka sender handle.
///
/// Publishes in binary content mode: CloudEvents attributes travel as
/// message headers, the body is the raw payload and the partition key (if
/// any) becomes the message key.
pub struct Kafka {
    /// Kafka producer handle
    producer: FutureProducer,
    /// Timeout for sending messages
    timeout: Duration,
}

#[async_trait]
impl Sender for Kafka {
    type Error = rdkafka::error::KafkaError;

    fn content_mode(&self) -> ContentMode {
        ContentMode::Binary
    }

    /// Send a message to Kafka.
    ///
    /// Maps the `EncodedMessage` fields as follows:
    /// - `topic` → Kafka topic
    /// - `key` → Kafka message key
    /// - `headers` → Kafka message headers
    /// - `body` → message payload
    #[tracing::instrument(skip_all, fields(topic = %message.topic))]
    async fn publish(&mut self, message: EncodedMessage) -> Result<DeliveryStatus, Self::Error> {
        let headers = message
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            });

        let mut record = FutureRecord::<str, [u8]>::to(&message.topic)
            .payload(&message.body[..])
            .headers(headers);
        if let Some(key) = message.key.as_deref() {
            record = record.key(key);
        }

        let (partition, offset) = self
            .producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| e)?;

        tracing::debug!(partition, offset, "Kafka message has been published");
        Ok(DeliveryStatus::Persisted)
    }
}
