//! Client assembly: components, capabilities, contract parsing and the
//! dispatch table.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::{self, Capability};
use crate::client::{Client, HyperClient};
use crate::codec::{Decoder, DefaultErrorDecoder, Encoder, ErrorDecoder, JsonDecoder, JsonEncoder};
use crate::contract::{ApiDescription, Contract, DeclarativeContract};
use crate::error::{ContractError, InvokeError};
use crate::handler::{Args, MethodHandler, RequestInterceptor};
use crate::request::Options;
use crate::response::Response;
use crate::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::target::{HardCodedTarget, Target};

/// Assembles an [`ApiClient`] from pluggable components.
///
/// Every component has a stock default: JSON codecs, the hyper client, the
/// built-in marker contract and the bounded-backoff retry policy. Only a
/// target (or base URL) is mandatory.
pub struct ApiClientBuilder {
    target: Option<Arc<dyn Target>>,
    contract: Arc<dyn Contract>,
    client: Option<Arc<dyn Client>>,
    encoder: Arc<dyn Encoder>,
    decoder: Arc<dyn Decoder>,
    error_decoder: Arc<dyn ErrorDecoder>,
    retry_policy: Arc<dyn RetryPolicy>,
    interceptors: Vec<Arc<dyn RequestInterceptor>>,
    capabilities: Vec<Arc<dyn Capability>>,
    options: Options,
    absent_on_not_found: bool,
}

impl Default for ApiClientBuilder {
    fn default() -> Self {
        ApiClientBuilder {
            target: None,
            contract: Arc::new(DeclarativeContract::default()),
            client: None,
            encoder: Arc::new(JsonEncoder),
            decoder: Arc::new(JsonDecoder),
            error_decoder: Arc::new(DefaultErrorDecoder),
            retry_policy: Arc::new(DefaultRetryPolicy::default()),
            interceptors: Vec::new(),
            capabilities: Vec::new(),
            options: Options::default(),
            absent_on_not_found: false,
        }
    }
}

impl ApiClientBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets a fixed base URL. The target name defaults to the API
    /// description name at build time.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.target = Some(Arc::new(HardCodedTarget::new("base", url)));
        self
    }

    /// Routes through a custom target.
    #[must_use]
    pub fn target(mut self, target: Arc<dyn Target>) -> Self {
        self.target = Some(target);
        self
    }

    #[must_use]
    pub fn contract(mut self, contract: Arc<dyn Contract>) -> Self {
        self.contract = contract;
        self
    }

    #[must_use]
    pub fn client(mut self, client: Arc<dyn Client>) -> Self {
        self.client = Some(client);
        self
    }

    #[must_use]
    pub fn encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = encoder;
        self
    }

    #[must_use]
    pub fn decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = decoder;
        self
    }

    #[must_use]
    pub fn error_decoder(mut self, error_decoder: Arc<dyn ErrorDecoder>) -> Self {
        self.error_decoder = error_decoder;
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Appends a request interceptor; interceptors run in registration
    /// order on every call.
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Appends a capability; capabilities wrap components at build time in
    /// registration order.
    #[must_use]
    pub fn capability(mut self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.push(capability);
        self
    }

    #[must_use]
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Treats 404 responses as an absent value instead of an error, for
    /// result types that declare an empty value.
    #[must_use]
    pub fn absent_on_not_found(mut self, tolerate: bool) -> Self {
        self.absent_on_not_found = tolerate;
        self
    }

    /// Parses the description through the contract and assembles the
    /// dispatch table.
    pub fn build(self, api: &ApiDescription) -> Result<ApiClient, ContractError> {
        let target = self.target.ok_or(ContractError::MissingTarget)?;

        let client = self
            .client
            .unwrap_or_else(|| Arc::new(HyperClient::new()));
        let client = capability::enrich_client(&self.capabilities, client);
        let encoder = capability::enrich_encoder(&self.capabilities, self.encoder);
        let decoder = capability::enrich_decoder(&self.capabilities, self.decoder);
        let error_decoder =
            capability::enrich_error_decoder(&self.capabilities, self.error_decoder);

        let descriptors = self.contract.parse(api)?;
        let mut handlers: HashMap<String, Arc<MethodHandler>> =
            HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors.iter() {
            let handler = MethodHandler::new(
                Arc::new(descriptor.clone()),
                Arc::clone(&target),
                Arc::clone(&client),
                Arc::clone(&encoder),
                Arc::clone(&decoder),
                Arc::clone(&error_decoder),
                Arc::clone(&self.retry_policy),
                self.interceptors.clone(),
                self.options,
                self.absent_on_not_found,
            );
            handlers.insert(descriptor.method_name().to_owned(), Arc::new(handler));
        }
        tracing::debug!(
            api = api.name(),
            target = target.name(),
            methods = handlers.len(),
            "built api client"
        );
        Ok(ApiClient {
            name: api.name().to_owned(),
            handlers: Arc::new(handlers),
        })
    }
}

/// A ready-to-call client for one API description.
///
/// Cloning is cheap; clones share the dispatch table and the underlying
/// transport.
#[derive(Clone)]
pub struct ApiClient {
    name: String,
    handlers: Arc<HashMap<String, Arc<MethodHandler>>>,
}

impl ApiClient {
    #[must_use]
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::new()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration keys of every dispatchable method, sorted.
    #[must_use]
    pub fn config_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .handlers
            .values()
            .map(|h| h.descriptor().config_key().to_owned())
            .collect();
        keys.sort();
        keys
    }

    /// Invokes `method` and downcasts the decoded value to `T`.
    ///
    /// `T` must match the declared [`ResultType`](crate::ResultType) of the
    /// method; a mismatch fails with [`InvokeError::ResultType`]. Dropping
    /// the returned future cancels the call.
    pub async fn call<T: Any>(&self, method: &str, args: Args) -> Result<T, InvokeError> {
        let handler = self.handler(method)?;
        let value = handler.invoke(&args).await?;
        let declared = handler.descriptor().result().name();
        value
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| InvokeError::ResultType { declared })
    }

    /// Invokes a method declared with [`ResultType::raw`](crate::ResultType::raw)
    /// and returns the raw response, body unconsumed.
    pub async fn call_raw(&self, method: &str, args: Args) -> Result<Response, InvokeError> {
        self.call::<Response>(method, args).await
    }

    fn handler(&self, method: &str) -> Result<&Arc<MethodHandler>, InvokeError> {
        self.handlers.get(method).ok_or_else(|| InvokeError::UnknownMethod {
            name: method.to_owned(),
        })
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("name", &self.name)
            .field("methods", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ResultType;
    use crate::contract::{MethodDescription, ParamDescription, Param, RequestLine};

    fn api() -> ApiDescription {
        ApiDescription::new("Users").method(
            MethodDescription::new("get_user")
                .marker(RequestLine::get("/users/{id}"))
                .param(ParamDescription::new("id").marker(Param::new("id")))
                .returning(ResultType::of::<serde_json::Value>()),
        )
    }

    #[test]
    fn build_requires_a_target() {
        let err = ApiClient::builder().build(&api()).unwrap_err();
        assert!(matches!(err, ContractError::MissingTarget));
    }

    #[test]
    fn build_produces_dispatch_table() {
        let client = ApiClient::builder()
            .base_url("http://api.test")
            .build(&api())
            .unwrap();
        assert_eq!(client.config_keys(), vec!["Users#get_user(id)".to_owned()]);
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let client = ApiClient::builder()
            .base_url("http://api.test")
            .build(&api())
            .unwrap();
        let err = client
            .call::<serde_json::Value>("nope", Args::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::UnknownMethod { ref name } if name == "nope"));
    }
}
