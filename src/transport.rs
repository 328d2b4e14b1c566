//! Send path: envelopes out to a broker.
//!
//! The transport is built around Tower's `Service` abstraction so middleware
//! (timeouts, rate limits, tracing) composes over any backend, while the
//! backend itself only deals with pooled sender handles.
//!
//! ## Key components
//!
//! - [`Transport`]: public-facing wrapper implementing `tower::Service`, with
//!   a value-returning [`send`](Transport::send)
//! - [`PooledSender`]: service that rents a handle, encodes and publishes
//! - [`Sender`]: trait implemented by the pooled handle of each backend
//! - [`OperateResult`]: outcome of one send, failures included
//! - [`TransportError`]: unified error type with tracing context

pub mod inmemory;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use tower::{Service, ServiceExt};
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    broker::BrokerAddress,
    envelope::codec::{CloudEventsCodec, CodecError, ContentMode, EncodedMessage, EnvelopeCodec},
    pool::{ConnectionError, ConnectionPool, ManageConnection},
};

pub use inmemory::{GroupStats, InMemoryBroker, InMemoryConnector, InMemorySender, PollFault};

/// How far the broker confirmed a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Stored by the broker.
    Persisted,
    /// Sent, but the broker did not confirm storage before replying.
    PossiblyPersisted,
    /// Refused or lost.
    NotPersisted,
}

impl DeliveryStatus {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Persisted | DeliveryStatus::PossiblyPersisted
        )
    }
}

/// Trait implemented by the pooled sender handle of a backend.
///
/// A sender delivers one already-encoded message to the broker and reports
/// how far the broker confirmed it.
#[async_trait::async_trait]
pub trait Sender: Send + 'static {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Wire layout this backend expects.
    fn content_mode(&self) -> ContentMode;

    /// Publish one message.
    async fn publish(&mut self, message: EncodedMessage) -> Result<DeliveryStatus, Self::Error>;
}

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the main entry point for sending envelopes. It wraps an
/// underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Turns failures into a failed [`OperateResult`] in [`send`](Transport::send)
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<M> Transport<PooledSender<M>>
where
    M: ManageConnection,
    M::Connection: Sender,
{
    /// Create a transport publishing CloudEvents through the given pool.
    pub fn new(pool: ConnectionPool<M>) -> Self {
        Self::from_service(PooledSender::new(pool))
    }

    pub fn broker_address(&self) -> BrokerAddress {
        self.service.broker_address()
    }
}

impl<S> Transport<S> {
    /// Wrap an arbitrary envelope service.
    pub fn from_service(service: S) -> Self {
        Self { service }
    }

    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }

    /// Send an [`Envelope`].
    ///
    /// Never fails for broker-side reasons: every error from renting, encoding,
    /// publishing or confirming is reported through the returned
    /// [`OperateResult`].
    #[tracing::instrument(skip_all, fields(id = %envelope.id(), event_type = %envelope.event_type()))]
    pub async fn send(&self, envelope: Envelope) -> OperateResult
    where
        S: Service<Envelope> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        match self.service.clone().oneshot(envelope).await {
            Ok(_) => OperateResult::success(),
            Err(err) => {
                let err = TransportError::from_boxed(err.into());
                tracing::warn!(code = err.kind().as_label(), "Envelope not sent: {}", err.kind());
                OperateResult::failed(OperateError::from(&err))
            }
        }
    }
}

/// Tower `Service` implementation for `Transport`.
///
/// Delegates readiness and request handling to the inner service while mapping
/// all errors into [`TransportError`].
impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::from_boxed(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        let mut service = self.service.clone();
        std::mem::swap(&mut service, &mut self.service);

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::from_boxed(e.into()))?;
            Ok(())
        })
    }
}

/// Service that publishes envelopes through pooled sender handles.
///
/// Each call rents a handle, encodes the envelope in the handle's content mode,
/// publishes, and waits up to the confirm timeout for the broker's answer. The
/// handle goes back to the pool on every exit path; a handle whose confirm
/// timed out is discarded instead.
pub struct PooledSender<M: ManageConnection> {
    pool: ConnectionPool<M>,
    codec: Arc<dyn EnvelopeCodec>,
    confirm_timeout: Duration,
}

impl<M: ManageConnection> Clone for PooledSender<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            codec: Arc::clone(&self.codec),
            confirm_timeout: self.confirm_timeout,
        }
    }
}

impl<M> PooledSender<M>
where
    M: ManageConnection,
    M::Connection: Sender,
{
    /// Default confirm timeout is 5 seconds.
    pub fn new(pool: ConnectionPool<M>) -> Self {
        Self {
            pool,
            codec: Arc::new(CloudEventsCodec),
            confirm_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_codec(mut self, codec: impl EnvelopeCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn broker_address(&self) -> BrokerAddress {
        self.pool.broker_address()
    }

    async fn send(self, envelope: Envelope) -> Result<(), TransportError> {
        let mut handle = self.pool.rent().await.map_err(TransportError::connection)?;

        let message = self
            .codec
            .encode(&envelope, handle.content_mode())
            .map_err(TransportError::encode)?;

        let status = match tokio::time::timeout(self.confirm_timeout, handle.publish(message)).await
        {
            Ok(status) => status.map_err(|e| TransportError::sender(e.into()))?,
            Err(_) => {
                handle.discard();
                return Err(TransportError::new(TransportErrorKind::ConfirmTimeout(
                    self.confirm_timeout,
                )));
            }
        };

        if !status.is_success() {
            return Err(TransportError::new(TransportErrorKind::NotPersisted));
        }

        tracing::debug!(?status, "Envelope published");
        Ok(())
    }
}

impl<M> Service<Envelope> for PooledSender<M>
where
    M: ManageConnection,
    M::Connection: Sender,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Envelope) -> Self::Future {
        Box::pin(self.clone().send(req))
    }
}

/// Outcome of one send.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperateResult {
    error: Option<OperateError>,
}

impl OperateResult {
    pub fn success() -> Self {
        Self { error: None }
    }

    pub fn failed(error: OperateError) -> Self {
        Self { error: Some(error) }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&OperateError> {
        self.error.as_ref()
    }

    pub fn into_result(self) -> Result<(), OperateError> {
        match self.error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Why a send failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperateError {
    /// Stable label of the failure class, e.g. `publisher_sent_failed`.
    pub code: String,
    pub description: String,
}

impl From<&TransportError> for OperateError {
    fn from(err: &TransportError) -> Self {
        Self {
            code: err.kind().as_label().to_owned(),
            description: err.kind().to_string(),
        }
    }
}

impl std::fmt::Display for OperateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

impl std::error::Error for OperateError {}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// No sender handle could be rented.
    Connection(ConnectionError),
    /// The envelope could not be encoded.
    Encode(CodecError),
    /// Errors originating from the sender backend or middleware.
    Sender(tower::BoxError),
    /// The broker did not confirm in time.
    ConfirmTimeout(Duration),
    /// The broker refused the message.
    NotPersisted,
}

impl TransportErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            TransportErrorKind::Connection(_) => "broker_connection",
            TransportErrorKind::Encode(_) => "encode",
            TransportErrorKind::Sender(_) => "publisher_sent_failed",
            TransportErrorKind::ConfirmTimeout(_) => "confirm_timeout",
            TransportErrorKind::NotPersisted => "not_persisted",
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::Connection(err) => write!(
                f,
                "Connection error: broker {} unreachable",
                err.broker_address()
            ),
            TransportErrorKind::Encode(err) => write!(f, "Encode error: {err}"),
            TransportErrorKind::Sender(err) => write!(f, "Sender error: {err}"),
            TransportErrorKind::ConfirmTimeout(timeout) => {
                write!(f, "Broker did not confirm within {timeout:?}")
            }
            TransportErrorKind::NotPersisted => write!(f, "Broker did not persist the message"),
        }
    }
}

impl TransportError {
    fn new(kind: TransportErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// Create a sender-related transport error.
    pub fn sender(err: tower::BoxError) -> Self {
        Self::new(TransportErrorKind::Sender(err))
    }

    pub fn connection(err: ConnectionError) -> Self {
        Self::new(TransportErrorKind::Connection(err))
    }

    pub fn encode(err: CodecError) -> Self {
        Self::new(TransportErrorKind::Encode(err))
    }

    /// Recover a `TransportError` passed through middleware, or wrap any other error.
    pub fn from_boxed(err: tower::BoxError) -> Self {
        match err.downcast::<TransportError>() {
            Ok(err) => *err,
            Err(err) => Self::sender(err),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.kind)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Connection(err) => Some(err),
            TransportErrorKind::Encode(err) => Some(err),
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::ConfirmTimeout(_) | TransportErrorKind::NotPersisted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::pool::PoolConfig;

    fn envelope() -> Envelope {
        Envelope::builder("e-1", "orders.created")
            .source("/tests")
            .json(br#"{"id":1}"#.to_vec())
            .build()
    }

    #[tokio::test]
    async fn send_publishes_and_returns_handle() {
        let broker = InMemoryBroker::new();
        let pool = ConnectionPool::new(broker.connector(), PoolConfig::bounded(NonZeroUsize::MIN));
        let transport = Transport::new(pool.clone());

        let result = transport.send(envelope()).await;

        assert!(result.succeeded());
        assert_eq!(broker.published().len(), 1);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.available(), Some(1));
    }

    #[tokio::test]
    async fn refused_message_is_a_failed_result() {
        let broker = InMemoryBroker::new();
        broker.set_delivery_status(DeliveryStatus::NotPersisted);
        let pool = ConnectionPool::new(broker.connector(), PoolConfig::bounded(NonZeroUsize::MIN));
        let transport = Transport::new(pool.clone());

        let result = transport.send(envelope()).await;

        assert_eq!(result.error().unwrap().code, "not_persisted");
        // The handle went back despite the failure.
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn possibly_persisted_counts_as_success() {
        let broker = InMemoryBroker::new();
        broker.set_delivery_status(DeliveryStatus::PossiblyPersisted);
        let transport = Transport::new(ConnectionPool::new(
            broker.connector(),
            PoolConfig::default(),
        ));

        assert!(transport.send(envelope()).await.succeeded());
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_failed_result() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true);
        let transport = Transport::new(ConnectionPool::new(
            broker.connector(),
            PoolConfig::default(),
        ));

        let result = transport.send(envelope()).await;

        assert!(!result.succeeded());
        assert_eq!(result.error().unwrap().code, "broker_connection");
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn sender_error_is_a_failed_result() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publish("socket closed");
        let pool = ConnectionPool::new(broker.connector(), PoolConfig::bounded(NonZeroUsize::MIN));
        let transport = Transport::new(pool.clone());

        let result = transport.send(envelope()).await;

        let error = result.error().unwrap();
        assert_eq!(error.code, "publisher_sent_failed");
        assert!(error.description.contains("socket closed"));
        assert_eq!(pool.available(), Some(1));
    }

    #[tokio::test]
    async fn layered_transport_keeps_error_kind() {
        let broker = InMemoryBroker::new();
        broker.set_delivery_status(DeliveryStatus::NotPersisted);
        let transport = Transport::new(ConnectionPool::new(
            broker.connector(),
            PoolConfig::default(),
        ))
        .layer(tower::layer::layer_fn(|service| service));

        let result = transport.send(envelope()).await;
        assert_eq!(result.error().unwrap().code, "not_persisted");
    }

    #[tokio::test]
    async fn transport_as_service_reports_typed_error() {
        let broker = InMemoryBroker::new();
        broker.set_delivery_status(DeliveryStatus::NotPersisted);
        let transport = Transport::new(ConnectionPool::new(
            broker.connector(),
            PoolConfig::default(),
        ));

        let err = transport.clone().oneshot(envelope()).await.unwrap_err();
        assert!(matches!(err.kind(), TransportErrorKind::NotPersisted));

        // Nested inside another transport, the inner kind is recovered.
        let outer = Transport::from_service(transport);
        assert_eq!(outer.send(envelope()).await.error().unwrap().code, "not_persisted");

        broker.set_delivery_status(DeliveryStatus::Persisted);
        assert!(outer.send(envelope()).await.succeeded());
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn published_message_decodes_to_sent_envelope() {
        let broker = InMemoryBroker::new();
        let transport = Transport::new(ConnectionPool::new(
            broker.connector(),
            PoolConfig::default(),
        ));
        let sent = envelope().with_header("tenant", "acme");

        assert!(transport.send(sent.clone()).await.succeeded());

        let published = broker.published();
        assert_eq!(published[0].topic, "orders.created");
        assert_eq!(CloudEventsCodec.decode(&published[0]).unwrap(), sent);
    }
}
