use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    Channel, Connection, ConnectionProperties, Consumer,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use tokio::sync::OnceCell;

use crate::{
    broker::{BrokerAddress, LogCallback, LogEvent, LogKind},
    consumer::{ConsumerClient, ConsumerClientFactory, ConsumerError, PollError, Received},
    envelope::codec::{CONTENT_TYPE_HEADER, EncodedMessage},
    pool::ConnectionError,
    transport::rabbitmq::RabbitMqOptions,
};

/// Creates one [`RabbitMqConsumer`] per session, connected up front.
#[derive(Debug, Clone)]
pub struct RabbitMqConsumerFactory {
    options: RabbitMqOptions,
}

impl RabbitMqConsumerFactory {
    pub fn new(options: RabbitMqOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ConsumerClientFactory for RabbitMqConsumerFactory {
    type Client = RabbitMqConsumer;

    async fn create(&self, group: &str, _auto_unsubscribe: bool) -> Result<RabbitMqConsumer, ConnectionError> {
        let client = RabbitMqConsumer::new(group, self.options.clone());
        client.open().await?;
        Ok(client)
    }
}

struct Session {
    connection: Connection,
    channel: Channel,
}

/// Consumer on a durable queue named after the group.
///
/// Subscribing binds each topic (wildcards included) as a routing key of the
/// exchange. A rejected delivery is requeued.
pub struct RabbitMqConsumer {
    group: String,
    options: RabbitMqOptions,
    session: OnceCell<Session>,
    consumer: Option<Consumer>,
    log: Option<LogCallback>,
}

impl RabbitMqConsumer {
    pub fn new(group: impl Into<String>, options: RabbitMqOptions) -> Self {
        Self {
            group: group.into(),
            options,
            session: OnceCell::new(),
            consumer: None,
            log: None,
        }
    }

    async fn open(&self) -> Result<&Session, ConnectionError> {
        self.session
            .get_or_try_init(|| async {
                let address = self.options.broker_address();
                let wrap = |e: lapin::Error| ConnectionError::new(address.clone(), Box::new(e));

                let connection = Connection::connect(&self.options.uri, ConnectionProperties::default())
                    .await
                    .map_err(wrap)?;
                let channel = connection.create_channel().await.map_err(wrap)?;
                self.options.declare_exchange(&channel).await.map_err(wrap)?;
                channel
                    .queue_declare(
                        &self.group,
                        QueueDeclareOptions {
                            durable: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(wrap)?;

                Ok(Session { connection, channel })
            })
            .await
    }

    fn session(&self) -> Result<&Session, ConsumerError> {
        self.session.get().ok_or_else(ConsumerError::not_connected)
    }

    fn report(&self, kind: LogKind, reason: impl Into<String>) {
        if let Some(log) = &self.log {
            log(LogEvent::new(kind, reason));
        }
    }
}

fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        AMQPValue::ByteArray(bytes) => Some(String::from_utf8_lossy(bytes.as_slice()).into_owned()),
        AMQPValue::Void => None,
        other => Some(format!("{other:?}")),
    }
}

#[async_trait]
impl ConsumerClient for RabbitMqConsumer {
    type Delivery = Acker;

    fn broker_address(&self) -> BrokerAddress {
        self.options.broker_address()
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn on_log(&mut self, callback: LogCallback) {
        if let Some(session) = self.session.get() {
            let log = callback.clone();
            session.connection.on_error(move |err| {
                log(LogEvent::new(LogKind::ConsumerShutdown, err.to_string()));
            });
        }
        self.log = Some(callback);
    }

    async fn connect(&self) -> Result<(), ConsumerError> {
        self.open().await?;
        Ok(())
    }

    async fn subscribe(&mut self, topics: &[String]) -> Result<(), ConsumerError> {
        let session = self.session()?;
        for topic in topics {
            session
                .channel
                .queue_bind(
                    &self.group,
                    &self.options.exchange,
                    topic,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(ConsumerError::broker)?;
        }
        session
            .channel
            .basic_qos(self.options.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(ConsumerError::broker)?;

        let consumer = session
            .channel
            .basic_consume(
                &self.group,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(ConsumerError::broker)?;
        self.report(LogKind::ConsumerRegistered, consumer.tag().as_str());
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Received<Acker>>, PollError> {
        let Some(consumer) = self.consumer.as_mut() else {
            return Err(PollError::Fatal(ConsumerError::not_connected()));
        };
        let delivery = match tokio::time::timeout(timeout, consumer.next()).await {
            Err(_elapsed) => return Ok(None),
            Ok(Some(Ok(delivery))) => delivery,
            Ok(Some(Err(err))) => return Err(PollError::Fatal(ConsumerError::broker(err))),
            Ok(None) => {
                self.report(LogKind::ConsumerCancelled, self.group.clone());
                return Err(PollError::Fatal(ConsumerError::broker("consumer cancelled by broker")));
            }
        };

        let mut headers: crate::envelope::Headers = delivery
            .properties
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .filter_map(|(name, value)| {
                        Some((name.as_str().to_ascii_lowercase(), header_value(value)?))
                    })
                    .collect()
            })
            .unwrap_or_default();
        if let Some(content_type) = delivery.properties.content_type() {
            headers
                .entry(CONTENT_TYPE_HEADER.to_owned())
                .or_insert_with(|| content_type.as_str().to_owned());
        }

        Ok(Some(Received {
            message: EncodedMessage {
                topic: delivery.routing_key.as_str().to_owned(),
                key: None,
                headers,
                body: delivery.data.into(),
            },
            delivery: delivery.acker,
        }))
    }

    async fn commit(&mut self, delivery: Acker) -> Result<(), ConsumerError> {
        delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(ConsumerError::broker)?;
        Ok(())
    }

    async fn reject(&mut self, delivery: Acker) -> Result<(), ConsumerError> {
        delivery
            .reject(BasicRejectOptions { requeue: true })
            .await
            .map_err(ConsumerError::broker)?;
        Ok(())
    }

    async fn unsubscribe(&mut self, topics: &[String]) -> Result<(), ConsumerError> {
        let session = self.session()?;
        for topic in topics {
            session
                .channel
                .queue_unbind(&self.group, &self.options.exchange, topic, FieldTable::default())
                .await
                .map_err(ConsumerError::broker)?;
        }
        self.report(LogKind::ConsumerUnregistered, self.group.clone());
        Ok(())
    }

    async fn dispose(&mut self) {
        self.consumer = None;
        self.log = None;
        if let Some(session) = self.session.take() {
            if let Err(err) = session.channel.close(200, "Goodbye").await {
                tracing::debug!(error = %err, "Closing RabbitMQ channel failed");
            }
            if let Err(err) = session.connection.close(200, "Goodbye").await {
                tracing::debug!(error = %err, "Closing RabbitMQ connection failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use lapin::types::{ByteArray, LongString, ShortString};

    use super::*;

    #[test]
    fn header_values_are_stringified() {
        assert_eq!(
            header_value(&AMQPValue::LongString(LongString::from("orders.created"))),
            Some("orders.created".to_owned())
        );
        assert_eq!(
            header_value(&AMQPValue::ShortString(ShortString::from("1.0"))),
            Some("1.0".to_owned())
        );
        assert_eq!(
            header_value(&AMQPValue::ByteArray(ByteArray::from(b"acme".to_vec()))),
            Some("acme".to_owned())
        );
        assert_eq!(header_value(&AMQPValue::Void), None);
    }

    #[tokio::test]
    async fn poll_before_subscribe_is_fatal() {
        let mut client = RabbitMqConsumer::new("billing", RabbitMqOptions::new("amqp://localhost"));

        let err = client.poll(Duration::from_millis(10)).await.unwrap_err();

        assert!(matches!(err, PollError::Fatal(_)));
    }
}
