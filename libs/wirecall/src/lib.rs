#![warn(warnings)]

//! Declarative HTTP client invocation engine
//!
//! `wirecall` turns a declarative API description into a callable client:
//! - URI templates with strict expansion and selective percent-encoding
//! - A marker-dialect contract with pluggable handler registries
//! - JSON codecs over a `serde_json::Value` interchange model
//! - Bounded retries with exponential backoff and `Retry-After` support
//! - Request interceptors and build-time capabilities
//! - A name-keyed dispatcher with typed result downcasting
//!
//! # Example
//!
//! ```ignore
//! use wirecall::{
//!     ApiClient, ApiDescription, Args, MethodDescription, Param,
//!     ParamDescription, RequestLine, ResultType,
//! };
//!
//! let api = ApiDescription::new("GitHub").method(
//!     MethodDescription::new("contributors")
//!         .marker(RequestLine::get("/repos/{owner}/{repo}/contributors"))
//!         .param(ParamDescription::new("owner").marker(Param::new("owner")))
//!         .param(ParamDescription::new("repo").marker(Param::new("repo")))
//!         .returning(ResultType::of::<Vec<Contributor>>()),
//! );
//!
//! let client = ApiClient::builder()
//!     .base_url("https://api.github.com")
//!     .build(&api)?;
//!
//! let contributors: Vec<Contributor> = client
//!     .call("contributors", Args::new().arg("netflix").arg("feign"))
//!     .await?;
//! ```

mod builder;
mod capability;
mod client;
mod codec;
mod contract;
mod error;
mod handler;
mod request;
mod response;
mod retry;
mod target;
mod template;

pub use builder::{ApiClient, ApiClientBuilder};
pub use capability::Capability;
pub use client::{Client, HyperClient, HyperClientBuilder};
pub use codec::{
    BodyValue, BoxedValue, Decoder, DefaultErrorDecoder, Encoder, ErrorDecoder, FormEncoder,
    JsonDecoder, JsonEncoder, ResultType, ERROR_BODY_PREVIEW_LIMIT, query_pairs, status_error,
};
pub use contract::{
    ApiDescription, BodyParam, BodyTemplate, Contract, DeclarativeContract, HeaderLines, Ignored,
    MethodDescription, MethodDescriptor, Param, ParamDescription, QueryMapParam, RequestLine,
};
pub use error::{ContractError, DecodeError, EncodeError, InvokeError, TemplateError};
pub use handler::{Arg, Args, RequestInterceptor};
pub use request::{BodySpec, CollectionFormat, Options, Request, RequestTemplate};
pub use response::{
    parse_retry_after_at, Response, ResponseBody, DEFAULT_MAX_BODY_SIZE,
};
pub use retry::{
    DefaultRetryPolicy, ExponentialBackoff, NeverRetry, RetryDecision, RetryPolicy, RetryState,
};
pub use target::{HardCodedTarget, Target};
pub use template::{percent_encode, ExpandMode, Template, VarMap, VarValue};
