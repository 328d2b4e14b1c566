//! Broker-facing descriptive types shared by the send and receive sides.

use std::sync::Arc;

/// Which kind of broker a transport or consumer client is bound to, and where.
///
/// Purely descriptive; used in logs and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BrokerAddress {
    name: String,
    endpoint: Option<String>,
}

impl BrokerAddress {
    pub fn new(name: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            name: name.into(),
            endpoint,
        }
    }

    /// Parse the `name$endpoint` form. Without a `$` the whole string is the endpoint.
    pub fn parse(address: &str) -> Self {
        match address.split_once('$') {
            Some((name, endpoint)) => Self::new(name, Some(endpoint.replace('$', ""))),
            None => Self::new("", Some(address.to_owned())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}${}", self.name, self.endpoint.as_deref().unwrap_or_default())
    }
}

/// Kind of operational signal a consumer client reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    ConsumerCancelled,
    ConsumerRegistered,
    ConsumerUnregistered,
    ConsumerShutdown,
    ConsumeError,
    ConsumeRetry,
    ServerConnError,
    ExceptionReceived,
    AsyncErrorEvent,
    ConnectError,
    InvalidIdFormat,
    MessageNotInflight,
}

impl LogKind {
    /// Whether this signal means the current listen session cannot continue.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            LogKind::ConsumerShutdown
                | LogKind::ServerConnError
                | LogKind::ConnectError
                | LogKind::ExceptionReceived
        )
    }

    pub fn as_label(self) -> &'static str {
        match self {
            LogKind::ConsumerCancelled => "consumer_cancelled",
            LogKind::ConsumerRegistered => "consumer_registered",
            LogKind::ConsumerUnregistered => "consumer_unregistered",
            LogKind::ConsumerShutdown => "consumer_shutdown",
            LogKind::ConsumeError => "consume_error",
            LogKind::ConsumeRetry => "consume_retry",
            LogKind::ServerConnError => "server_conn_error",
            LogKind::ExceptionReceived => "exception_received",
            LogKind::AsyncErrorEvent => "async_error_event",
            LogKind::ConnectError => "connect_error",
            LogKind::InvalidIdFormat => "invalid_id_format",
            LogKind::MessageNotInflight => "message_not_inflight",
        }
    }
}

/// Operational signal from a consumer client to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub kind: LogKind,
    pub reason: String,
}

impl LogEvent {
    pub fn new(kind: LogKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Receiver of [`LogEvent`]s. Called synchronously from driver code, so it
/// must not block.
pub type LogCallback = Arc<dyn Fn(LogEvent) + Send + Sync>;

/// Match a topic against a dot-separated pattern where `*` stands for exactly
/// one word and `#` for zero or more words.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let topic: Vec<&str> = topic.split('.').collect();
    matches_words(&pattern, &topic)
}

fn matches_words(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((&"#", rest)) => (0..=topic.len()).any(|skip| matches_words(rest, &topic[skip..])),
        Some((&word, rest)) => match topic.split_first() {
            Some((&head, tail)) => {
                (word == "*" || word.eq_ignore_ascii_case(head)) && matches_words(rest, tail)
            }
            None => false,
        },
    }
}
