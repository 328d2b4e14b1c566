//! Application-facing publish API.
//!
//! ## Example
//!
//! ```rust
//! use switchyard::{
//!     Publisher, Transport,
//!     pool::{ConnectionPool, PoolConfig},
//!     transport::InMemoryBroker,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! let publisher = Publisher::new(Transport::new(ConnectionPool::new(
//!     broker.connector(),
//!     PoolConfig::default(),
//! )));
//!
//! publisher
//!     .publish("orders.created", &serde_json::json!({ "id": 1 }), Some("/billing"))
//!     .await?;
//!
//! assert_eq!(broker.published().len(), 1);
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use serde::Serialize;
use tower::Service;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::{
    Envelope,
    envelope::ValidationError,
    transport::{OperateError, Transport},
};

/// Publishes JSON payloads as CloudEvents through a [`Transport`].
#[derive(Clone)]
pub struct Publisher<S> {
    transport: Transport<S>,
}

impl<S> Publisher<S>
where
    S: Service<Envelope> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    pub fn new(transport: Transport<S>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }

    /// Publish `payload` as an event of type `topic`.
    pub async fn publish<T>(&self, topic: &str, payload: &T, source: Option<&str>) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_with_headers(topic, payload, source, std::iter::empty::<(&str, &str)>())
            .await
    }

    /// Publish `payload` with extra headers (CloudEvents extension attributes).
    #[tracing::instrument(skip(self, payload, headers))]
    pub async fn publish_with_headers<T, K, V>(
        &self,
        topic: &str,
        payload: &T,
        source: Option<&str>,
        headers: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized,
        K: AsRef<str>,
        V: Into<String>,
    {
        let envelope = build_envelope(topic, payload, source, headers)?;
        let id = envelope.id().to_owned();

        self.transport
            .send(envelope)
            .await
            .into_result()
            .map_err(|err| PublishError::new(PublishErrorKind::Send(err)))?;

        tracing::debug!(id, "Event published");
        Ok(())
    }
}

/// The envelope a publish of `payload` would send.
///
/// Assigns a fresh id and the current time, and marks the content as JSON.
pub fn build_envelope<T, K, V>(
    topic: &str,
    payload: &T,
    source: Option<&str>,
    headers: impl IntoIterator<Item = (K, V)>,
) -> Result<Envelope, PublishError>
where
    T: Serialize + ?Sized,
    K: AsRef<str>,
    V: Into<String>,
{
    if topic.trim().is_empty() {
        return Err(PublishError::new(PublishErrorKind::EmptyTopic));
    }

    let data = serde_json::to_vec(payload)
        .map_err(|err| PublishError::new(PublishErrorKind::Serialize(err)))?;

    let mut builder = Envelope::builder(Uuid::new_v4().simple().to_string(), topic)
        .time(Utc::now())
        .json(data);
    if let Some(source) = source {
        builder = builder.source(source);
    }
    let envelope = builder.build().with_headers(headers);

    envelope
        .validate()
        .map_err(|err| PublishError::new(PublishErrorKind::InvalidEnvelope(err)))?;
    Ok(envelope)
}

/// Publish errors.
#[derive(Debug)]
pub struct PublishError {
    context: SpanTrace,
    kind: PublishErrorKind,
}

/// Publish errors kind.
#[derive(Debug)]
pub enum PublishErrorKind {
    EmptyTopic,
    /// The payload could not be serialized to JSON.
    Serialize(serde_json::Error),
    /// The resulting envelope broke an invariant, e.g. a reserved header name.
    InvalidEnvelope(ValidationError),
    /// The transport reported a failed send.
    Send(OperateError),
}

impl PublishError {
    fn new(kind: PublishErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PublishErrorKind::EmptyTopic => writeln!(f, "Topic name is required"),
            PublishErrorKind::Serialize(err) => writeln!(f, "Payload serialization failed: {err}"),
            PublishErrorKind::InvalidEnvelope(err) => writeln!(f, "Event is not valid: {err}"),
            PublishErrorKind::Send(err) => writeln!(f, "Send failed: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PublishErrorKind::EmptyTopic => None,
            PublishErrorKind::Serialize(err) => Some(err),
            PublishErrorKind::InvalidEnvelope(err) => Some(err),
            PublishErrorKind::Send(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::{
        envelope::{JSON_CONTENT_TYPE, ValidationErrorKind, codec::{CloudEventsCodec, EnvelopeCodec}},
        pool::{ConnectionPool, PoolConfig},
        transport::{InMemoryBroker, InMemoryConnector, PooledSender},
    };

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: u32,
    }

    fn publisher(broker: &InMemoryBroker) -> Publisher<PooledSender<InMemoryConnector>> {
        Publisher::new(Transport::new(ConnectionPool::new(
            broker.connector(),
            PoolConfig::default(),
        )))
    }

    #[test]
    fn built_envelope_is_a_valid_json_event() {
        let envelope = build_envelope(
            "orders.created",
            &Order { id: 1 },
            None,
            std::iter::empty::<(&str, &str)>(),
        )
        .unwrap();

        assert_eq!(envelope.event_type(), "orders.created");
        assert_eq!(envelope.id().len(), 32);
        assert_eq!(envelope.content_type(), Some(JSON_CONTENT_TYPE));
        assert!(envelope.time().is_some());
        assert!(envelope.validate().is_ok());
        assert_eq!(envelope.json::<Order>().unwrap(), Some(Order { id: 1 }));
    }

    #[test]
    fn ids_are_unique() {
        let a = build_envelope("t", &1, None, std::iter::empty::<(&str, &str)>()).unwrap();
        let b = build_envelope("t", &1, None, std::iter::empty::<(&str, &str)>()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn empty_topic_is_refused() {
        let err = build_envelope("  ", &1, None, std::iter::empty::<(&str, &str)>()).unwrap_err();
        assert!(matches!(err.kind(), PublishErrorKind::EmptyTopic));
    }

    #[test]
    fn reserved_header_is_refused() {
        let err = build_envelope("orders.created", &1, None, [("Source", "x")]).unwrap_err();
        assert!(matches!(
            err.kind(),
            PublishErrorKind::InvalidEnvelope(e)
                if *e.kind() == ValidationErrorKind::ReservedHeaderName("source".into())
        ));
    }

    #[tokio::test]
    async fn publishes_through_the_transport() {
        let broker = InMemoryBroker::new();

        publisher(&broker)
            .publish_with_headers(
                "orders.created",
                &Order { id: 1 },
                Some("/billing"),
                [("Tenant", "acme")],
            )
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        let envelope = CloudEventsCodec.decode(&published[0]).unwrap();
        assert_eq!(envelope.event_type(), "orders.created");
        assert_eq!(envelope.source(), Some("/billing"));
        assert_eq!(envelope.header("tenant"), Some("acme"));
        assert_eq!(envelope.json::<Order>().unwrap(), Some(Order { id: 1 }));
    }

    #[tokio::test]
    async fn failed_send_is_raised() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true);

        let err = publisher(&broker)
            .publish("orders.created", &Order { id: 1 }, None)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), PublishErrorKind::Send(e) if e.code == "broker_connection"));
        assert!(broker.published().is_empty());
    }
}
