//! The event envelope moving through publishers, brokers and dispatchers.
//!
//! An [`Envelope`] is an immutable CloudEvents-shaped value: a handful of
//! required attributes (`id`, `type`), optional context (`source`, `time`),
//! an optional [`Content`] payload and a bag of string headers that map to
//! CloudEvents extension attributes.
//!
//! Construction never validates. Envelopes decoded from a broker may be
//! malformed, and the supervising loop must be able to see them in order to
//! discard them, so validity is an explicit [`Envelope::validate`] step that
//! runs before anything reaches application code.
//!
//! ## Example
//!
//! ```rust
//! use switchyard::Envelope;
//!
//! let envelope = Envelope::builder("a1b2", "orders.created")
//!     .source("/billing")
//!     .json(br#"{"id":1}"#.to_vec())
//!     .header("Tenant", "acme")
//!     .build();
//!
//! assert!(envelope.validate().is_ok());
//! assert_eq!(envelope.header("tenant"), Some("acme"));
//! ```

pub mod codec;

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Header carrying the consumer group an envelope was received by.
pub const GROUP_HEADER: &str = "group";

/// Content type used for JSON payloads.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Attribute names that cannot be used as header names.
const RESERVED_ATTRIBUTES: &[&str] = &[
    "id",
    "type",
    "source",
    "time",
    "specversion",
    "datacontenttype",
    "data",
    "data_base64",
];

/// Header bag keyed by lower-cased name.
pub type Headers = BTreeMap<String, String>;

/// Opaque payload together with its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    content_type: Option<String>,
    data: Bytes,
}

impl Content {
    pub fn new(content_type: Option<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type,
            data: data.into(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Whether the payload is declared as JSON (`application/json` or a
    /// `+json` structured suffix).
    pub fn is_json(&self) -> bool {
        self.content_type.as_deref().is_some_and(is_json_media_type)
    }
}

pub(crate) fn is_json_media_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == JSON_CONTENT_TYPE || essence.ends_with("+json")
}

/// One event.
///
/// Envelopes are cheap to clone: the payload is reference counted.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    id: String,
    event_type: String,
    source: Option<String>,
    time: Option<DateTime<Utc>>,
    content: Option<Content>,
    headers: Headers,
}

impl Envelope {
    /// Start building an envelope with the two required attributes.
    pub fn builder(id: impl Into<String>, event_type: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder {
            envelope: Envelope {
                id: id.into(),
                event_type: event_type.into(),
                source: None,
                time: None,
                content: None,
                headers: Headers::new(),
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The event type, which doubles as the topic / routing key.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }

    pub fn content(&self) -> Option<&Content> {
        self.content.as_ref()
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.content.as_ref().map(Content::data)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content.as_ref().and_then(Content::content_type)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Look up a header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The consumer group the envelope was delivered to, if it came from a broker.
    pub fn group(&self) -> Option<&str> {
        self.header(GROUP_HEADER)
    }

    /// Return a copy of this envelope with one more header.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Return a copy of this envelope with the given headers merged in.
    pub fn with_headers<K, V>(mut self, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.headers
                .insert(name.as_ref().to_ascii_lowercase(), value.into());
        }
        self
    }

    /// Deserialize the payload as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.data()
            .map(|data| serde_json::from_slice(data))
            .transpose()
    }

    /// Check the envelope invariants.
    ///
    /// Only valid envelopes are ever handed to application callbacks.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::new(ValidationErrorKind::MissingId));
        }
        if self.event_type.trim().is_empty() {
            return Err(ValidationError::new(ValidationErrorKind::MissingType));
        }
        if self.source.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(ValidationError::new(ValidationErrorKind::EmptySource));
        }
        for name in self.headers.keys() {
            check_header_name(name)?;
        }
        Ok(())
    }
}

fn check_header_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::new(
            ValidationErrorKind::InvalidHeaderName(name.to_owned()),
        ));
    }
    if RESERVED_ATTRIBUTES.contains(&name) {
        return Err(ValidationError::new(
            ValidationErrorKind::ReservedHeaderName(name.to_owned()),
        ));
    }
    Ok(())
}

/// Builder for [`Envelope`].
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    envelope: Envelope,
}

impl EnvelopeBuilder {
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.envelope.source = Some(source.into());
        self
    }

    pub fn time(mut self, time: DateTime<Utc>) -> Self {
        self.envelope.time = Some(time);
        self
    }

    pub fn content(mut self, content: Content) -> Self {
        self.envelope.content = Some(content);
        self
    }

    /// Set a JSON payload from already-serialized bytes.
    pub fn json(self, data: impl Into<Bytes>) -> Self {
        self.content(Content::new(Some(JSON_CONTENT_TYPE.to_owned()), data))
    }

    /// Add a header. Names are stored lower-cased.
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.envelope = self.envelope.with_header(name, value);
        self
    }

    pub fn build(self) -> Envelope {
        self.envelope
    }
}

/// Error returned by [`Envelope::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    kind: ValidationErrorKind,
}

/// Envelope invariant that was violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    MissingId,
    MissingType,
    EmptySource,
    InvalidHeaderName(String),
    ReservedHeaderName(String),
}

impl ValidationError {
    fn new(kind: ValidationErrorKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> &ValidationErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ValidationErrorKind::MissingId => write!(f, "envelope id is required"),
            ValidationErrorKind::MissingType => write!(f, "envelope type is required"),
            ValidationErrorKind::EmptySource => write!(f, "envelope source must not be empty"),
            ValidationErrorKind::InvalidHeaderName(name) => {
                write!(f, "invalid header name {name:?}")
            }
            ValidationErrorKind::ReservedHeaderName(name) => {
                write!(f, "header name {name:?} is a reserved attribute")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let envelope = Envelope::builder("1", "orders.created")
            .header("X-Tenant", "acme")
            .build();

        assert_eq!(envelope.header("x-tenant"), Some("acme"));
        assert_eq!(envelope.header("X-TENANT"), Some("acme"));
        assert_eq!(envelope.headers().len(), 1);
    }

    #[test]
    fn empty_type_is_invalid() {
        let envelope = Envelope::builder("1", "  ").build();
        assert_eq!(
            envelope.validate().unwrap_err().kind(),
            &ValidationErrorKind::MissingType
        );
    }

    #[test]
    fn reserved_header_is_invalid() {
        let envelope = Envelope::builder("1", "orders.created")
            .header("Type", "other")
            .build();
        assert_eq!(
            envelope.validate().unwrap_err().kind(),
            &ValidationErrorKind::ReservedHeaderName("type".into())
        );
    }

    #[test]
    fn with_header_leaves_original_untouched() {
        let original = Envelope::builder("1", "orders.created").build();
        let grouped = original.clone().with_header(GROUP_HEADER, "billing");

        assert_eq!(original.group(), None);
        assert_eq!(grouped.group(), Some("billing"));
    }

    #[test]
    fn json_content_detection() {
        assert!(Content::new(Some("application/json; charset=utf-8".into()), "{}").is_json());
        assert!(Content::new(Some("application/vnd.acme+json".into()), "{}").is_json());
        assert!(!Content::new(Some("text/plain".into()), "hi").is_json());
        assert!(!Content::new(None, "hi").is_json());
    }
}
