#![doc = include_str!("../README.md")]

pub mod broker;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod host;
pub mod pool;
pub mod publisher;
pub mod subscriber;
pub mod supervisor;
pub mod transport;

pub use tower::BoxError;

#[doc(inline)]
pub use envelope::Envelope;

#[doc(inline)]
pub use transport::{OperateResult, Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use publisher::{PublishError, Publisher};

#[doc(inline)]
pub use host::{Host, HostError};

#[doc(inline)]
pub use supervisor::{DefaultSupervisorHook, Supervisor, SupervisorHook};
