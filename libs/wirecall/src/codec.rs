//! Body translation: encoders, decoders, the error decoder and the typed
//! result descriptor that carries decoded values through the erased
//! dispatch table.

use std::any::Any;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{DecodeError, EncodeError, InvokeError};
use crate::request::RequestTemplate;
use crate::response::Response;

/// Cap on error body previews carried inside [`InvokeError::Status`].
pub const ERROR_BODY_PREVIEW_LIMIT: usize = 8 * 1024;

/// A decoded result travelling through the dispatcher's erased table.
pub type BoxedValue = Box<dyn Any + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultKind {
    /// A deserializable value.
    Value,
    /// The caller ignores the body; the call yields `()`.
    Unit,
    /// The caller receives the raw [`Response`], body unconsumed.
    Raw,
}

/// Describes the declared result of a method: how to decode it from JSON
/// and, optionally, how to produce a canonical empty value for absent
/// (404/204) responses.
///
/// The descriptor captures monomorphized function pointers at declaration
/// time, so the dispatch table itself stays type-erased.
#[derive(Clone)]
pub struct ResultType {
    name: &'static str,
    kind: ResultKind,
    from_json: Option<fn(Value) -> Result<BoxedValue, serde_json::Error>>,
    empty: Option<fn() -> BoxedValue>,
}

impl ResultType {
    /// A deserializable result with no empty fallback. Absent-tolerant
    /// methods should prefer [`ResultType::with_empty`].
    #[must_use]
    pub fn of<T>() -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        ResultType {
            name: std::any::type_name::<T>(),
            kind: ResultKind::Value,
            from_json: Some(|value| {
                serde_json::from_value::<T>(value).map(|t| Box::new(t) as BoxedValue)
            }),
            empty: None,
        }
    }

    /// A deserializable result whose `Default` value stands in for absent
    /// responses when the client opts into absent-on-not-found.
    #[must_use]
    pub fn with_empty<T>() -> Self
    where
        T: DeserializeOwned + Default + Send + 'static,
    {
        ResultType {
            empty: Some(|| Box::new(T::default()) as BoxedValue),
            ..Self::of::<T>()
        }
    }

    /// The method yields `()`; any successful response body is discarded.
    #[must_use]
    pub fn unit() -> Self {
        ResultType {
            name: "()",
            kind: ResultKind::Unit,
            from_json: None,
            empty: Some(|| Box::new(())),
        }
    }

    /// The method yields the raw [`Response`] for any status, bypassing
    /// decoding and error decoding entirely.
    #[must_use]
    pub fn raw() -> Self {
        ResultType {
            name: "Response",
            kind: ResultKind::Raw,
            from_json: None,
            empty: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn is_unit(&self) -> bool {
        self.kind == ResultKind::Unit
    }

    #[must_use]
    pub fn is_raw(&self) -> bool {
        self.kind == ResultKind::Raw
    }

    /// Runs the captured deserializer over an interchange value.
    pub fn decode_json(&self, value: Value) -> Result<BoxedValue, DecodeError> {
        match self.from_json {
            Some(decode) => decode(value).map_err(DecodeError::from),
            None => Err(DecodeError::NotDecodable { type_name: self.name }),
        }
    }

    /// Canonical empty value, when the declaration provided one.
    #[must_use]
    pub fn empty_value(&self) -> Option<BoxedValue> {
        self.empty.map(|make| make())
    }
}

impl std::fmt::Debug for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultType")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A runtime body argument, already lifted into the interchange model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyValue {
    /// A structured value the encoder serializes.
    Json(Value),
    /// Pre-serialized bytes passed through untouched.
    Bytes(Bytes),
}

impl BodyValue {
    /// Lifts any serializable value into the interchange model.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, EncodeError> {
        Ok(BodyValue::Json(serde_json::to_value(value)?))
    }
}

/// Turns a body argument into template body bytes plus a content type.
///
/// `declared` is the method's declared result descriptor; the stock
/// encoders ignore it, but content-negotiating encoders can vary the
/// request representation on it.
pub trait Encoder: Send + Sync {
    fn encode(
        &self,
        value: &BodyValue,
        declared: &ResultType,
        template: &mut RequestTemplate,
    ) -> Result<(), EncodeError>;
}

/// Serializes structured bodies as JSON. Raw bytes pass through with an
/// octet-stream content type. An explicit `Content-Type` header on the
/// template always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn encode(
        &self,
        value: &BodyValue,
        _declared: &ResultType,
        template: &mut RequestTemplate,
    ) -> Result<(), EncodeError> {
        match value {
            BodyValue::Json(json) => {
                let bytes = serde_json::to_vec(json)?;
                template.body_literal(Bytes::from(bytes), Some("application/json"));
            }
            BodyValue::Bytes(bytes) => {
                template.body_literal(bytes.clone(), Some("application/octet-stream"));
            }
        }
        Ok(())
    }
}

/// Serializes flat JSON objects as `application/x-www-form-urlencoded`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormEncoder;

impl Encoder for FormEncoder {
    fn encode(
        &self,
        value: &BodyValue,
        _declared: &ResultType,
        template: &mut RequestTemplate,
    ) -> Result<(), EncodeError> {
        let json = match value {
            BodyValue::Json(json) => json,
            BodyValue::Bytes(_) => {
                return Err(EncodeError::Unsupported {
                    reason: "form encoder requires a structured value".into(),
                });
            }
        };
        let pairs = query_pairs(json)?;
        let encoded = serde_urlencoded::to_string(&pairs)?;
        template.body_literal(
            Bytes::from(encoded),
            Some("application/x-www-form-urlencoded"),
        );
        Ok(())
    }
}

/// Flattens a JSON object into query pairs.
///
/// Scalars stringify, arrays contribute one pair per element, `null`
/// entries are skipped. Nested objects are rejected.
pub fn query_pairs(value: &Value) -> Result<Vec<(String, String)>, EncodeError> {
    let object = value.as_object().ok_or_else(|| EncodeError::Unsupported {
        reason: "query map must be a JSON object".into(),
    })?;
    let mut pairs: Vec<(String, String)> = Vec::with_capacity(object.len());
    for (name, entry) in object {
        match entry {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    pairs.push((name.clone(), scalar_to_string(name, item)?));
                }
            }
            other => pairs.push((name.clone(), scalar_to_string(name, other)?)),
        }
    }
    Ok(pairs)
}

fn scalar_to_string(name: &str, value: &Value) -> Result<String, EncodeError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(EncodeError::Unsupported {
            reason: format!("query map entry '{name}' is not a scalar or array of scalars"),
        }),
    }
}

/// Turns a successful response body into the declared result.
#[async_trait]
pub trait Decoder: Send + Sync {
    async fn decode(
        &self,
        response: &mut Response,
        result: &ResultType,
    ) -> Result<BoxedValue, DecodeError>;
}

/// Decodes response bodies as JSON through the interchange model.
///
/// An empty body falls back to the result's empty value when one exists;
/// otherwise it surfaces as a JSON parse error.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

#[async_trait]
impl Decoder for JsonDecoder {
    async fn decode(
        &self,
        response: &mut Response,
        result: &ResultType,
    ) -> Result<BoxedValue, DecodeError> {
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(InvokeError::Decode(e)) => return Err(e),
            Err(other) => return Err(DecodeError::Body(Box::new(other))),
        };
        if bytes.is_empty() {
            if let Some(empty) = result.empty_value() {
                return Ok(empty);
            }
        }
        let value: Value = serde_json::from_slice(&bytes)?;
        result.decode_json(value)
    }
}

/// Classifies a non-2xx response into an [`InvokeError`].
#[async_trait]
pub trait ErrorDecoder: Send + Sync {
    async fn decode(&self, config_key: &str, response: &mut Response) -> InvokeError;
}

/// Default classification: every non-2xx becomes a status error carrying a
/// bounded body preview; it is retryable exactly when the server supplied a
/// parseable `Retry-After` value.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorDecoder;

#[async_trait]
impl ErrorDecoder for DefaultErrorDecoder {
    async fn decode(&self, config_key: &str, response: &mut Response) -> InvokeError {
        status_error(config_key, response, SystemTime::now()).await
    }
}

/// Builds the status error against an explicit reference clock. Exposed so
/// custom error decoders can reuse the default classification.
pub async fn status_error(config_key: &str, response: &mut Response, now: SystemTime) -> InvokeError {
    let status = response.status();
    let reason = response.reason();
    let content_type = response.content_type().map(str::to_owned);
    let retry_after = response.retry_after(now);
    let body_preview = match response.bytes().await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let mut preview: String = text.chars().take(ERROR_BODY_PREVIEW_LIMIT).collect();
            if preview.len() < text.len() {
                preview.push_str("...");
            }
            preview
        }
        Err(_) => String::new(),
    };
    tracing::debug!(
        config_key,
        status = status.as_u16(),
        retryable = retry_after.is_some(),
        "classified error response"
    );
    InvokeError::Status {
        status,
        reason,
        body_preview,
        content_type,
        retry_after,
        retryable: retry_after.is_some(),
    }
}
