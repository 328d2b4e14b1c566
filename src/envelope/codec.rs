//! Wire encoding of envelopes.
//!
//! Brokers move bytes and string headers; application code deals in
//! [`Envelope`]s. The [`EnvelopeCodec`] contract sits between the two and is
//! the only place that knows about a wire format. [`CloudEventsCodec`]
//! implements the CloudEvents 1.0 JSON format in both content modes:
//!
//! - [`ContentMode::Binary`]: attributes travel as `ce_`-prefixed headers,
//!   the body is the raw payload and `content-type` carries its media type.
//! - [`ContentMode::Structured`]: the whole event is a JSON document and the
//!   `content-type` header is `application/cloudevents+json`.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::value::{RawValue, to_raw_value};

use crate::envelope::{Content, Envelope, Headers};

/// Version of the CloudEvents specification this codec speaks.
pub const SPEC_VERSION: &str = "1.0";

/// Header carrying the media type of the body.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Media type of a structured-mode event.
pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json; charset=utf-8";

/// Extension attribute used as the broker partition / message key.
pub const PARTITION_KEY: &str = "partitionkey";

const BINARY_PREFIX: &str = "ce_";

/// Header prefixes accepted on decode, compared case-insensitively.
const ACCEPTED_PREFIXES: &[&str] = &["ce_", "ce-", "cloudevents_", "cloudevents:"];

/// How an envelope is laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    Structured,
    Binary,
}

/// A message in broker shape: destination, optional key, string headers and body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedMessage {
    /// Topic or routing key.
    pub topic: String,
    /// Partition / message key, when the broker supports one.
    pub key: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// Converts envelopes to and from their wire shape.
pub trait EnvelopeCodec: Send + Sync + 'static {
    fn encode(&self, envelope: &Envelope, mode: ContentMode) -> Result<EncodedMessage, CodecError>;

    /// Decode a received message.
    ///
    /// Must fail with a descriptive error when the versioning headers are
    /// absent or unrecognized.
    fn decode(&self, message: &EncodedMessage) -> Result<Envelope, CodecError>;
}

/// CloudEvents 1.0 JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloudEventsCodec;

impl EnvelopeCodec for CloudEventsCodec {
    fn encode(&self, envelope: &Envelope, mode: ContentMode) -> Result<EncodedMessage, CodecError> {
        let key = envelope.header(PARTITION_KEY).map(str::to_owned);
        let topic = envelope.event_type().to_owned();

        match mode {
            ContentMode::Binary => Ok(EncodedMessage {
                topic,
                key,
                headers: binary_headers(envelope),
                body: envelope.data().cloned().unwrap_or_default(),
            }),
            ContentMode::Structured => {
                let mut headers = BTreeMap::new();
                headers.insert(
                    CONTENT_TYPE_HEADER.to_owned(),
                    STRUCTURED_CONTENT_TYPE.to_owned(),
                );
                Ok(EncodedMessage {
                    topic,
                    key,
                    headers,
                    body: structured_body(envelope)?,
                })
            }
        }
    }

    fn decode(&self, message: &EncodedMessage) -> Result<Envelope, CodecError> {
        let content_type = message
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(CONTENT_TYPE_HEADER))
            .map(|(_, v)| v.as_str());

        match content_type {
            Some(ct) if ct.to_ascii_lowercase().starts_with("application/cloudevents-batch") => {
                Err(CodecError::new(CodecErrorKind::UnsupportedContentMode(
                    ct.to_owned(),
                )))
            }
            Some(ct) if ct.to_ascii_lowercase().starts_with("application/cloudevents") => {
                decode_structured(&message.body)
            }
            _ => decode_binary(message, content_type),
        }
    }
}

fn binary_headers(envelope: &Envelope) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    let mut put = |name: &str, value: String| {
        headers.insert(format!("{BINARY_PREFIX}{name}"), value);
    };

    put("specversion", SPEC_VERSION.to_owned());
    put("id", envelope.id().to_owned());
    put("type", envelope.event_type().to_owned());
    if let Some(source) = envelope.source() {
        put("source", source.to_owned());
    }
    if let Some(time) = envelope.time() {
        put("time", format_time(time));
    }
    for (name, value) in envelope.headers() {
        put(name, value.clone());
    }

    if let Some(content_type) = envelope.content_type() {
        headers.insert(CONTENT_TYPE_HEADER.to_owned(), content_type.to_owned());
    }
    headers
}

fn structured_body(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let mut doc: BTreeMap<&str, Box<RawValue>> = BTreeMap::new();
    let text = |value: &str| to_raw_value(value).map_err(CodecError::json);

    doc.insert("specversion", text(SPEC_VERSION)?);
    doc.insert("id", text(envelope.id())?);
    doc.insert("type", text(envelope.event_type())?);
    if let Some(source) = envelope.source() {
        doc.insert("source", text(source)?);
    }
    if let Some(time) = envelope.time() {
        doc.insert("time", text(&format_time(time))?);
    }
    for (name, value) in envelope.headers() {
        doc.insert(name.as_str(), text(value)?);
    }

    if let Some(content) = envelope.content() {
        if let Some(content_type) = content.content_type() {
            doc.insert("datacontenttype", text(content_type)?);
        }
        match embeddable_json(content) {
            Some(raw) => {
                doc.insert("data", raw);
            }
            None => {
                doc.insert("data_base64", text(&BASE64.encode(content.data()))?);
            }
        }
    }

    serde_json::to_vec(&doc)
        .map(Bytes::from)
        .map_err(CodecError::json)
}

/// JSON payloads are embedded verbatim so decoding gives back the exact bytes.
fn embeddable_json(content: &Content) -> Option<Box<RawValue>> {
    if !content.is_json() {
        return None;
    }
    let text = std::str::from_utf8(content.data()).ok()?;
    // Surrounding whitespace would not survive the enclosing document.
    if text != text.trim() {
        return None;
    }
    RawValue::from_string(text.to_owned()).ok()
}

fn decode_structured(body: &[u8]) -> Result<Envelope, CodecError> {
    let mut doc: BTreeMap<String, Box<RawValue>> =
        serde_json::from_slice(body).map_err(CodecError::json)?;

    let version = doc
        .remove("specversion")
        .ok_or(CodecError::new(CodecErrorKind::MissingSpecVersion))
        .and_then(|raw| raw_to_string(&raw))?;
    check_version(&version)?;

    let mut take = |name: &str| doc.remove(name).map(|raw| raw_to_string(&raw)).transpose();

    let id = take("id")?.ok_or(CodecError::missing("id"))?;
    let event_type = take("type")?.ok_or(CodecError::missing("type"))?;
    let source = take("source")?;
    let time = take("time")?.map(|t| parse_time(&t)).transpose()?;
    let content_type = take("datacontenttype")?;
    let data_base64 = take("data_base64")?;

    let data = match (doc.remove("data"), data_base64) {
        (Some(raw), _) => Some(Bytes::from(raw.get().to_owned())),
        (None, Some(encoded)) => Some(Bytes::from(
            BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| CodecError::new(CodecErrorKind::Base64(e)))?,
        )),
        (None, None) => None,
    };

    let mut headers = Headers::new();
    for (name, raw) in doc {
        headers.insert(name.to_ascii_lowercase(), raw_to_string(&raw)?);
    }

    Ok(assemble(id, event_type, source, time, content_type, data, headers))
}

fn decode_binary(message: &EncodedMessage, content_type: Option<&str>) -> Result<Envelope, CodecError> {
    let mut attributes = Headers::new();
    for (name, value) in &message.headers {
        let lower = name.to_ascii_lowercase();
        if let Some(attribute) = ACCEPTED_PREFIXES
            .iter()
            .find_map(|prefix| lower.strip_prefix(prefix))
        {
            attributes.insert(attribute.to_owned(), value.clone());
        }
    }

    let version = attributes
        .remove("specversion")
        .ok_or(CodecError::new(CodecErrorKind::MissingSpecVersion))?;
    check_version(&version)?;

    let id = attributes.remove("id").ok_or(CodecError::missing("id"))?;
    let event_type = attributes
        .remove("type")
        .ok_or(CodecError::missing("type"))?;
    let source = attributes.remove("source");
    let time = attributes
        .remove("time")
        .map(|t| parse_time(&t))
        .transpose()?;

    let data = (!message.body.is_empty() || content_type.is_some()).then(|| message.body.clone());

    Ok(assemble(
        id,
        event_type,
        source,
        time,
        content_type.map(str::to_owned),
        data,
        attributes,
    ))
}

fn assemble(
    id: String,
    event_type: String,
    source: Option<String>,
    time: Option<DateTime<Utc>>,
    content_type: Option<String>,
    data: Option<Bytes>,
    headers: Headers,
) -> Envelope {
    let mut builder = Envelope::builder(id, event_type);
    if let Some(source) = source {
        builder = builder.source(source);
    }
    if let Some(time) = time {
        builder = builder.time(time);
    }
    if let Some(data) = data {
        builder = builder.content(Content::new(content_type, data));
    }
    builder.build().with_headers(headers)
}

fn raw_to_string(raw: &RawValue) -> Result<String, CodecError> {
    match serde_json::from_str::<String>(raw.get()) {
        Ok(value) => Ok(value),
        // Non-string extension values keep their JSON text.
        Err(_) if !raw.get().starts_with('"') => Ok(raw.get().to_owned()),
        Err(e) => Err(CodecError::json(e)),
    }
}

fn check_version(version: &str) -> Result<(), CodecError> {
    if version == SPEC_VERSION {
        Ok(())
    } else {
        Err(CodecError::new(CodecErrorKind::UnsupportedSpecVersion(
            version.to_owned(),
        )))
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, CodecError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| CodecError::new(CodecErrorKind::InvalidTime(value.to_owned())))
}

/// Error returned when an envelope cannot be encoded or decoded.
#[derive(Debug)]
pub struct CodecError {
    kind: CodecErrorKind,
}

/// Codec error kind.
#[derive(Debug)]
pub enum CodecErrorKind {
    /// No `specversion` attribute was present.
    MissingSpecVersion,
    /// The `specversion` attribute names a version this codec does not speak.
    UnsupportedSpecVersion(String),
    /// A required attribute is absent.
    MissingAttribute(&'static str),
    InvalidTime(String),
    UnsupportedContentMode(String),
    Json(serde_json::Error),
    Base64(base64::DecodeError),
}

impl CodecError {
    fn new(kind: CodecErrorKind) -> Self {
        Self { kind }
    }

    fn missing(attribute: &'static str) -> Self {
        Self::new(CodecErrorKind::MissingAttribute(attribute))
    }

    fn json(err: serde_json::Error) -> Self {
        Self::new(CodecErrorKind::Json(err))
    }

    pub fn kind(&self) -> &CodecErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            CodecErrorKind::MissingSpecVersion => {
                write!(f, "missing CloudEvents specversion attribute")
            }
            CodecErrorKind::UnsupportedSpecVersion(v) => {
                write!(f, "unsupported CloudEvents specversion {v:?}, expected {SPEC_VERSION}")
            }
            CodecErrorKind::MissingAttribute(name) => {
                write!(f, "missing required CloudEvents attribute {name:?}")
            }
            CodecErrorKind::InvalidTime(v) => write!(f, "invalid RFC 3339 time {v:?}"),
            CodecErrorKind::UnsupportedContentMode(ct) => {
                write!(f, "unsupported content mode {ct:?}")
            }
            CodecErrorKind::Json(err) => write!(f, "JSON error: {err}"),
            CodecErrorKind::Base64(err) => write!(f, "base64 error: {err}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            CodecErrorKind::Json(err) => Some(err),
            CodecErrorKind::Base64(err) => Some(err),
            _ => None,
        }
    }
}
