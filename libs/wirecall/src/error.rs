use std::time::{Duration, SystemTime};

use thiserror::Error;

/// Template expansion failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TemplateError {
    /// Strict expansion found a placeholder with no bound value.
    /// Carries the first unresolved placeholder name.
    #[error("unresolved placeholder '{{{name}}}' in template '{template}'")]
    Unresolved { name: String, template: String },
}

/// Contract parsing failure.
///
/// All variants are fatal at build time; the builder returns `Err` and no
/// dispatcher is produced.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ContractError {
    /// Method declares no HTTP verb.
    #[error("method {key} declares no HTTP verb (add a RequestLine marker)")]
    MissingVerb { key: String },

    /// Method declares more than one HTTP verb.
    #[error("method {key} declares more than one HTTP verb")]
    DuplicateVerb { key: String },

    /// Two methods resolve to the same configuration key.
    #[error("duplicate configuration key: {key}")]
    DuplicateKey { key: String },

    /// Two methods share a name; dispatch is by method name.
    #[error("duplicate method name: {name}")]
    DuplicateMethod { name: String },

    /// A placeholder in the template has no bound argument.
    #[error("method {key} references placeholder '{{{name}}}' with no bound argument")]
    UnboundPlaceholder { key: String, name: String },

    /// An argument binding names a placeholder that appears nowhere in the template.
    #[error("method {key}: argument '{param}' binds placeholder '{{{name}}}' that the template never references")]
    UnreferencedBinding {
        key: String,
        param: String,
        name: String,
    },

    /// A parameter is marked with conflicting roles (e.g. path variable and body).
    #[error("method {key}: parameter {index} has conflicting roles")]
    ConflictingRoles { key: String, index: usize },

    /// More than one parameter would become the request body.
    #[error("method {key} has more than one body parameter")]
    TooManyBodyParams { key: String },

    /// A request line could not be parsed into a verb and a path.
    #[error("invalid request line '{line}': {reason}")]
    InvalidRequestLine { line: String, reason: String },

    /// A header line is not of the form `Name: value`.
    #[error("invalid header line '{line}'")]
    InvalidHeaderLine { line: String },

    /// No base target configured on the builder.
    #[error("no target configured: set a base URL or a custom Target")]
    MissingTarget,
}

/// Body translation failure on the encode side. Never retried.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EncodeError {
    /// JSON serialization failed
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Form URL encoding failed
    #[error("form encoding failed: {0}")]
    Form(#[from] serde_urlencoded::ser::Error),

    /// The encoder cannot handle the supplied body value
    #[error("unsupported body value for encoder: {reason}")]
    Unsupported { reason: String },
}

/// Body translation failure on the decode side. Never retried, since the
/// response body was already consumed (or partially consumed) by the attempt.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DecodeError {
    /// JSON parsing failed
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading the response body failed mid-stream
    #[error("failed to read response body: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The declared result type has no canonical empty value for an
    /// absent (404/204) response
    #[error("result type {type_name} has no canonical empty value")]
    NoEmptyValue { type_name: &'static str },

    /// The declared result type is not backed by a deserializer
    /// (unit and raw results never reach a decoder)
    #[error("result type {type_name} is not decodable")]
    NotDecodable { type_name: &'static str },
}

/// Per-call error taxonomy.
///
/// Only [`InvokeError::Transport`], [`InvokeError::Timeout`] and
/// [`InvokeError::Status`] values with `retryable == true` are ever fed to the
/// retry policy; everything else surfaces on first occurrence.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InvokeError {
    /// Request building failed before any I/O happened
    #[error("failed to build request: {0}")]
    Build(#[from] http::Error),

    /// Template expansion failed while building the request
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Invalid header name produced while building the request
    #[error("invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value produced while building the request
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// The final URI did not parse as an absolute URI
    #[error("invalid URL '{url}': {reason}")]
    InvalidUri { url: String, reason: String },

    /// Body encoding failed; never retried
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Response decoding failed; never retried
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Transport error (connection refused, reset, DNS failure)
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A single request attempt timed out
    #[error("request attempt timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP non-2xx status, produced by the error decoder.
    ///
    /// `retryable` marks the retryable application error family; the default
    /// error decoder sets it when the server supplied a `Retry-After` value.
    #[error("HTTP {status}: {body_preview}")]
    Status {
        status: http::StatusCode,
        reason: Option<&'static str>,
        body_preview: String,
        content_type: Option<String>,
        /// Resume instant parsed from `Retry-After`, if present and valid
        retry_after: Option<SystemTime>,
        retryable: bool,
    },

    /// Response body exceeded the configured size limit
    #[error("response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// The call named a method the dispatcher does not know
    #[error("unknown method: {name}")]
    UnknownMethod { name: String },

    /// The call supplied the wrong number of arguments
    #[error("{config_key} takes {expected} arguments, got {actual}")]
    Arity {
        config_key: String,
        expected: usize,
        actual: usize,
    },

    /// An argument's shape does not fit the role the contract assigned it
    #[error("{config_key}: argument {index} {reason}")]
    ArgumentKind {
        config_key: String,
        index: usize,
        reason: &'static str,
    },

    /// The caller asked for a result type that does not match the declared one
    #[error("result type mismatch: method declares {declared}")]
    ResultType { declared: &'static str },
}

impl InvokeError {
    /// Whether this failure belongs to the retryable family
    /// (transport failures, attempt timeouts, retryable status errors).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            InvokeError::Transport(_) | InvokeError::Timeout(_) => true,
            InvokeError::Status { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Resume instant suggested by the server, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<SystemTime> {
        match self {
            InvokeError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<hyper::Error> for InvokeError {
    fn from(err: hyper::Error) -> Self {
        InvokeError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for InvokeError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        InvokeError::Transport(Box::new(err))
    }
}
