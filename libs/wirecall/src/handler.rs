//! Per-method invocation pipeline.
//!
//! One [`MethodHandler`] exists per parsed method. An invocation builds the
//! request exactly once (template clone, expansion, body encoding,
//! interceptors, targeting), then drives the execute/decode loop with the
//! retry policy. Request building and body translation failures surface
//! immediately; only transport failures, attempt timeouts and retryable
//! status errors re-enter the loop. Dropping the returned future cancels
//! the in-flight attempt and its sleeps.

use std::sync::Arc;

use http::StatusCode;
use serde::Serialize;

use crate::client::Client;
use crate::codec::{query_pairs, BodyValue, BoxedValue, Decoder, Encoder, ErrorDecoder, ResultType};
use crate::contract::MethodDescriptor;
use crate::error::{DecodeError, EncodeError, InvokeError};
use crate::request::{Options, Request, RequestTemplate};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::target::Target;
use crate::template::{VarMap, VarValue};

/// One positional argument of a call.
#[derive(Debug, Clone)]
pub enum Arg {
    /// A scalar placeholder value.
    Value(String),
    /// A multi-valued placeholder value (collection query parameters).
    Values(Vec<String>),
    /// A structured payload for body or query-map parameters.
    Payload(BodyValue),
}

impl Arg {
    /// A scalar from anything displayable.
    #[must_use]
    pub fn display(value: impl ToString) -> Self {
        Arg::Value(value.to_string())
    }

    /// A multi-valued argument.
    #[must_use]
    pub fn values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arg::Values(values.into_iter().map(Into::into).collect())
    }

    /// A structured payload, serialized through the interchange model.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, EncodeError> {
        Ok(Arg::Payload(BodyValue::from_serialize(value)?))
    }

    /// A pre-serialized payload passed through untouched.
    #[must_use]
    pub fn bytes(bytes: bytes::Bytes) -> Self {
        Arg::Payload(BodyValue::Bytes(bytes))
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Value(value.to_owned())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Value(value)
    }
}

impl From<Vec<String>> for Arg {
    fn from(values: Vec<String>) -> Self {
        Arg::Values(values)
    }
}

/// Positional arguments for one call, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Args(Vec<Arg>);

impl Args {
    #[must_use]
    pub fn new() -> Self {
        Args(Vec::new())
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.0.push(arg.into());
        self
    }

    /// Appends a structured payload argument.
    pub fn json<T: Serialize>(self, value: &T) -> Result<Self, EncodeError> {
        Ok(self.arg(Arg::json(value)?))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn get(&self, index: usize) -> Option<&Arg> {
        self.0.get(index)
    }
}

/// Mutates the resolved template before targeting. Applied in registration
/// order on every call, after placeholder expansion. Interceptors see the
/// template fresh each call, so repeated application never stacks.
pub trait RequestInterceptor: Send + Sync {
    fn apply(&self, template: &mut RequestTemplate);
}

/// The per-method pipeline: shared components plus the parsed descriptor.
pub(crate) struct MethodHandler {
    descriptor: Arc<MethodDescriptor>,
    target: Arc<dyn Target>,
    client: Arc<dyn Client>,
    encoder: Arc<dyn Encoder>,
    decoder: Arc<dyn Decoder>,
    error_decoder: Arc<dyn ErrorDecoder>,
    retry_policy: Arc<dyn RetryPolicy>,
    interceptors: Vec<Arc<dyn RequestInterceptor>>,
    options: Options,
    absent_on_not_found: bool,
}

impl MethodHandler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        descriptor: Arc<MethodDescriptor>,
        target: Arc<dyn Target>,
        client: Arc<dyn Client>,
        encoder: Arc<dyn Encoder>,
        decoder: Arc<dyn Decoder>,
        error_decoder: Arc<dyn ErrorDecoder>,
        retry_policy: Arc<dyn RetryPolicy>,
        interceptors: Vec<Arc<dyn RequestInterceptor>>,
        options: Options,
        absent_on_not_found: bool,
    ) -> Self {
        MethodHandler {
            descriptor,
            target,
            client,
            encoder,
            decoder,
            error_decoder,
            retry_policy,
            interceptors,
            options,
            absent_on_not_found,
        }
    }

    pub(crate) fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    pub(crate) async fn invoke(&self, args: &Args) -> Result<BoxedValue, InvokeError> {
        let request = self.build_request(args)?;
        let mut state = RetryState::new();
        loop {
            let failure = match self.attempt(&request).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };
            match self.retry_policy.decide(&mut state, &failure) {
                RetryDecision::ProceedAfter(delay) => {
                    tracing::debug!(
                        config_key = %self.descriptor.config_key(),
                        attempt = state.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Propagate => return Err(failure),
            }
        }
    }

    fn arg_error(&self, index: usize, reason: &'static str) -> InvokeError {
        InvokeError::ArgumentKind {
            config_key: self.descriptor.config_key().to_owned(),
            index,
            reason,
        }
    }

    fn build_request(&self, args: &Args) -> Result<Request, InvokeError> {
        let descriptor = &self.descriptor;
        let expected = descriptor.bindings().len();
        if args.len() != expected {
            return Err(InvokeError::Arity {
                config_key: descriptor.config_key().to_owned(),
                expected,
                actual: args.len(),
            });
        }

        let mut vars = VarMap::new();
        for (index, names) in descriptor.bindings().iter().enumerate() {
            if names.is_empty() {
                continue;
            }
            let encoded = descriptor.is_pre_encoded(index);
            let value = match args.get(index) {
                Some(Arg::Value(value)) => VarValue::Single {
                    value: value.clone(),
                    encoded,
                },
                Some(Arg::Values(values)) => VarValue::Multi {
                    values: values.clone(),
                    encoded,
                },
                Some(Arg::Payload(_)) | None => {
                    return Err(self.arg_error(index, "must be a placeholder value"));
                }
            };
            for name in names {
                vars.insert(name.clone(), value.clone());
            }
        }

        let mut template = descriptor.template().resolve(&vars)?;

        if let Some(index) = descriptor.body_index() {
            let payload = match args.get(index) {
                Some(Arg::Payload(payload)) => payload.clone(),
                Some(Arg::Value(value)) => {
                    BodyValue::Json(serde_json::Value::String(value.clone()))
                }
                Some(Arg::Values(_)) | None => {
                    return Err(self.arg_error(index, "must be a body payload"));
                }
            };
            self.encoder.encode(&payload, descriptor.result(), &mut template)?;
        }

        if let Some(index) = descriptor.query_map_index() {
            let json = match args.get(index) {
                Some(Arg::Payload(BodyValue::Json(json))) => json,
                _ => return Err(self.arg_error(index, "must be a structured query map")),
            };
            for (name, value) in query_pairs(json)? {
                template.query_literal(&name, &value);
            }
        }

        for interceptor in &self.interceptors {
            interceptor.apply(&mut template);
        }

        tracing::trace!(
            config_key = %descriptor.config_key(),
            path = template.path(),
            "resolved request template"
        );
        self.target.apply(template)
    }

    async fn attempt(&self, request: &Request) -> Result<BoxedValue, InvokeError> {
        let mut response = self.client.execute(request.clone(), &self.options).await?;
        let result = self.descriptor.result();

        if result.is_raw() {
            return Ok(Box::new(response));
        }

        let status = response.status();
        if self.absent_on_not_found
            && (status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT)
        {
            return absent_value(result);
        }

        if status.is_success() {
            if result.is_unit() {
                return Ok(Box::new(()));
            }
            return self
                .decoder
                .decode(&mut response, result)
                .await
                .map_err(InvokeError::from);
        }

        Err(self
            .error_decoder
            .decode(self.descriptor.config_key(), &mut response)
            .await)
    }
}

fn absent_value(result: &ResultType) -> Result<BoxedValue, InvokeError> {
    result.empty_value().ok_or(InvokeError::Decode(DecodeError::NoEmptyValue {
        type_name: result.name(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DefaultErrorDecoder, JsonDecoder, JsonEncoder};
    use crate::contract::{
        ApiDescription, Contract, DeclarativeContract, MethodDescription, Param,
        ParamDescription, RequestLine,
    };
    use crate::response::Response;
    use crate::retry::{DefaultRetryPolicy, ExponentialBackoff, NeverRetry};
    use crate::target::HardCodedTarget;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::header::HeaderMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Client stub that replays a script of canned outcomes and records
    /// the requests it saw.
    struct ScriptedClient {
        script: Mutex<Vec<Result<(StatusCode, HeaderMap, Bytes), InvokeError>>>,
        seen: Mutex<Vec<Request>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<(StatusCode, HeaderMap, Bytes), InvokeError>>) -> Self {
            ScriptedClient {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn ok(status: StatusCode, body: &'static [u8]) -> Result<(StatusCode, HeaderMap, Bytes), InvokeError> {
            Ok((status, HeaderMap::new(), Bytes::from_static(body)))
        }

        fn requests(&self) -> Vec<Request> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Client for ScriptedClient {
        async fn execute(&self, request: Request, _options: &Options) -> Result<Response, InvokeError> {
            self.seen.lock().unwrap().push(request);
            let next = self.script.lock().unwrap().remove(0);
            next.map(|(status, headers, body)| Response::from_bytes(status, headers, body))
        }
    }

    fn handler_for(
        api: ApiDescription,
        client: Arc<dyn Client>,
        retry_policy: Arc<dyn RetryPolicy>,
        absent_on_not_found: bool,
    ) -> MethodHandler {
        let contract = DeclarativeContract::default();
        let descriptors = contract.parse(&api).unwrap();
        MethodHandler::new(
            Arc::new(descriptors[0].clone()),
            Arc::new(HardCodedTarget::new("test", "http://api.test")),
            client,
            Arc::new(JsonEncoder),
            Arc::new(JsonDecoder),
            Arc::new(DefaultErrorDecoder),
            retry_policy,
            Vec::new(),
            Options::default(),
            absent_on_not_found,
        )
    }

    fn contributors_api() -> ApiDescription {
        ApiDescription::new("GitHub").method(
            MethodDescription::new("contributors")
                .marker(RequestLine::get("/repos/{owner}/{repo}/contributors"))
                .param(ParamDescription::new("owner").marker(Param::new("owner")))
                .param(ParamDescription::new("repo").marker(Param::new("repo")))
                .returning(ResultType::with_empty::<Vec<String>>()),
        )
    }

    fn no_delay_policy() -> Arc<dyn RetryPolicy> {
        Arc::new(DefaultRetryPolicy::new(3).backoff(ExponentialBackoff {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 2.0,
            jitter: 0.0,
        }))
    }

    #[tokio::test]
    async fn builds_and_decodes() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedClient::ok(
            StatusCode::OK,
            br#"["alice","bob"]"#,
        )]));
        let handler = handler_for(contributors_api(), client.clone(), Arc::new(NeverRetry), false);
        let args = Args::new().arg("netflix").arg("feign");
        let value = handler.invoke(&args).await.unwrap();
        let list = value.downcast::<Vec<String>>().unwrap();
        assert_eq!(*list, vec!["alice".to_owned(), "bob".to_owned()]);
        let requests = client.requests();
        assert_eq!(
            requests[0].uri().to_string(),
            "http://api.test/repos/netflix/feign/contributors"
        );
    }

    #[tokio::test]
    async fn arity_mismatch_fails_before_io() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let handler = handler_for(contributors_api(), client.clone(), Arc::new(NeverRetry), false);
        let err = handler.invoke(&Args::new().arg("netflix")).await.unwrap_err();
        assert!(matches!(err, InvokeError::Arity { expected: 2, actual: 1, .. }));
        assert!(client.requests().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_retried_with_same_request() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(InvokeError::Transport("connection reset".into())),
            ScriptedClient::ok(StatusCode::OK, br#"[]"#),
        ]));
        let handler = handler_for(contributors_api(), client.clone(), no_delay_policy(), false);
        let args = Args::new().arg("netflix").arg("feign");
        handler.invoke(&args).await.unwrap();
        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].uri(), requests[1].uri());
    }

    #[tokio::test]
    async fn retries_exhaust_and_propagate() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(InvokeError::Transport("reset".into())),
            Err(InvokeError::Transport("reset".into())),
            Err(InvokeError::Transport("reset".into())),
        ]));
        let handler = handler_for(contributors_api(), client.clone(), no_delay_policy(), false);
        let args = Args::new().arg("netflix").arg("feign");
        let err = handler.invoke(&args).await.unwrap_err();
        assert!(matches!(err, InvokeError::Transport(_)));
        assert_eq!(client.requests().len(), 3);
    }

    #[tokio::test]
    async fn terminal_status_is_not_retried() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedClient::ok(
            StatusCode::BAD_REQUEST,
            b"bad",
        )]));
        let handler = handler_for(contributors_api(), client.clone(), no_delay_policy(), false);
        let args = Args::new().arg("netflix").arg("feign");
        let err = handler.invoke(&args).await.unwrap_err();
        assert!(matches!(err, InvokeError::Status { status, .. } if status == StatusCode::BAD_REQUEST));
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn not_found_yields_empty_when_tolerated() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedClient::ok(
            StatusCode::NOT_FOUND,
            b"missing",
        )]));
        let handler = handler_for(contributors_api(), client, Arc::new(NeverRetry), true);
        let args = Args::new().arg("netflix").arg("gone");
        let value = handler.invoke(&args).await.unwrap();
        let list = value.downcast::<Vec<String>>().unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn not_found_is_an_error_by_default() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedClient::ok(
            StatusCode::NOT_FOUND,
            b"missing",
        )]));
        let handler = handler_for(contributors_api(), client, Arc::new(NeverRetry), false);
        let args = Args::new().arg("netflix").arg("gone");
        let err = handler.invoke(&args).await.unwrap_err();
        assert!(matches!(err, InvokeError::Status { status, .. } if status == StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn interceptors_apply_per_call_without_stacking() {
        struct AuthInterceptor;
        impl RequestInterceptor for AuthInterceptor {
            fn apply(&self, template: &mut RequestTemplate) {
                template.header("Authorization", "token secret");
            }
        }

        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::ok(StatusCode::OK, b"[]"),
            ScriptedClient::ok(StatusCode::OK, b"[]"),
        ]));
        let contract = DeclarativeContract::default();
        let descriptors = contract.parse(&contributors_api()).unwrap();
        let handler = MethodHandler::new(
            Arc::new(descriptors[0].clone()),
            Arc::new(HardCodedTarget::new("test", "http://api.test")),
            client.clone(),
            Arc::new(JsonEncoder),
            Arc::new(JsonDecoder),
            Arc::new(DefaultErrorDecoder),
            Arc::new(NeverRetry),
            vec![Arc::new(AuthInterceptor)],
            Options::default(),
            false,
        );
        let args = Args::new().arg("netflix").arg("feign");
        handler.invoke(&args).await.unwrap();
        handler.invoke(&args).await.unwrap();
        for request in client.requests() {
            let values: Vec<_> = request.headers().get_all("authorization").iter().collect();
            assert_eq!(values.len(), 1);
        }
    }

    #[tokio::test]
    async fn body_param_is_encoded() {
        let api = ApiDescription::new("Api").method(
            MethodDescription::new("create")
                .marker(RequestLine::post("/users"))
                .param(ParamDescription::new("user"))
                .returning(ResultType::unit()),
        );
        let client = Arc::new(ScriptedClient::new(vec![ScriptedClient::ok(
            StatusCode::CREATED,
            b"",
        )]));
        let handler = handler_for(api, client.clone(), Arc::new(NeverRetry), false);
        let args = Args::new()
            .json(&serde_json::json!({"login": "alice"}))
            .unwrap();
        handler.invoke(&args).await.unwrap();
        let request = &client.requests()[0];
        assert_eq!(request.body().map(|b| &b[..]), Some(&br#"{"login":"alice"}"#[..]));
        assert_eq!(
            request.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn encoder_sees_declared_result_type() {
        struct RecordingEncoder {
            declared_names: Mutex<Vec<&'static str>>,
        }
        impl Encoder for RecordingEncoder {
            fn encode(
                &self,
                value: &BodyValue,
                declared: &ResultType,
                template: &mut RequestTemplate,
            ) -> Result<(), EncodeError> {
                self.declared_names.lock().unwrap().push(declared.name());
                JsonEncoder.encode(value, declared, template)
            }
        }

        let api = ApiDescription::new("Api").method(
            MethodDescription::new("create")
                .marker(RequestLine::post("/users"))
                .param(ParamDescription::new("user"))
                .returning(ResultType::with_empty::<Vec<String>>()),
        );
        let encoder = Arc::new(RecordingEncoder {
            declared_names: Mutex::new(Vec::new()),
        });
        let client = Arc::new(ScriptedClient::new(vec![ScriptedClient::ok(
            StatusCode::OK,
            b"[]",
        )]));
        let contract = DeclarativeContract::default();
        let descriptors = contract.parse(&api).unwrap();
        let handler = MethodHandler::new(
            Arc::new(descriptors[0].clone()),
            Arc::new(HardCodedTarget::new("test", "http://api.test")),
            client,
            encoder.clone(),
            Arc::new(JsonDecoder),
            Arc::new(DefaultErrorDecoder),
            Arc::new(NeverRetry),
            Vec::new(),
            Options::default(),
            false,
        );
        let args = Args::new()
            .json(&serde_json::json!({"login": "alice"}))
            .unwrap();
        handler.invoke(&args).await.unwrap();
        assert_eq!(
            *encoder.declared_names.lock().unwrap(),
            vec![std::any::type_name::<Vec<String>>()]
        );
    }

    #[tokio::test]
    async fn raw_result_bypasses_error_decoding() {
        let api = ApiDescription::new("Api").method(
            MethodDescription::new("health")
                .marker(RequestLine::get("/health"))
                .returning(ResultType::raw()),
        );
        let client = Arc::new(ScriptedClient::new(vec![ScriptedClient::ok(
            StatusCode::SERVICE_UNAVAILABLE,
            b"down",
        )]));
        let handler = handler_for(api, client, Arc::new(NeverRetry), false);
        let value = handler.invoke(&Args::new()).await.unwrap();
        let response = value.downcast::<Response>().unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
