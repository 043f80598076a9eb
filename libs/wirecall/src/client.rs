//! Transport boundary and the stock hyper-based client.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, LOCATION, USER_AGENT};
use http::{Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as PooledClient;
use hyper_util::rt::TokioExecutor;

use crate::error::InvokeError;
use crate::request::{Options, Request};
use crate::response::{Response, DEFAULT_MAX_BODY_SIZE};

const DEFAULT_USER_AGENT: &str = concat!("wirecall/", env!("CARGO_PKG_VERSION"));
const MAX_REDIRECTS: usize = 10;

/// Executes one immutable request. The engine retries by calling `execute`
/// again with a clone of the same request, so implementations must not
/// consume shared state per call.
#[async_trait]
pub trait Client: Send + Sync {
    async fn execute(&self, request: Request, options: &Options) -> Result<Response, InvokeError>;
}

/// Pooled HTTP/1.1 client over hyper.
///
/// The read timeout from per-call [`Options`] bounds each attempt
/// end-to-end. The connect timeout is fixed on the connector at
/// construction, taken from [`HyperClientBuilder::connect_timeout`].
/// Redirects are followed in-client up to a fixed hop limit; 303 rewrites
/// the method to GET and drops the body, 307 and 308 replay both.
pub struct HyperClient {
    inner: PooledClient<HttpConnector, Full<Bytes>>,
    user_agent: HeaderValue,
    max_body_size: usize,
}

impl Default for HyperClient {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HyperClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> HyperClientBuilder {
        HyperClientBuilder::default()
    }

    async fn execute_once(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &http::HeaderMap,
        body: Option<&Bytes>,
    ) -> Result<(http::response::Parts, hyper::body::Incoming), InvokeError> {
        let mut builder = http::Request::builder().method(method.clone()).uri(uri.clone());
        if let Some(header_map) = builder.headers_mut() {
            *header_map = headers.clone();
            if !header_map.contains_key(USER_AGENT) {
                header_map.insert(USER_AGENT, self.user_agent.clone());
            }
        }
        let request = builder.body(Full::new(body.cloned().unwrap_or_default()))?;
        let response = self.inner.request(request).await?;
        Ok(response.into_parts())
    }

    async fn execute_following(
        &self,
        request: Request,
        options: &Options,
    ) -> Result<Response, InvokeError> {
        let (mut method, mut uri, headers, mut body) = request.into_parts();

        for _hop in 0..=MAX_REDIRECTS {
            let (parts, incoming) =
                self.execute_once(&method, &uri, &headers, body.as_ref()).await?;

            if options.follow_redirects && parts.status.is_redirection() {
                if let Some(location) = parts.headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
                    let next = resolve_location(&uri, location)?;
                    if parts.status == StatusCode::SEE_OTHER {
                        method = Method::GET;
                        body = None;
                    }
                    tracing::debug!(
                        status = parts.status.as_u16(),
                        location,
                        "following redirect"
                    );
                    uri = next;
                    continue;
                }
            }

            let stream = incoming
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
                .boxed();
            return Ok(Response::new(parts.status, parts.headers, stream)
                .with_max_body_size(self.max_body_size));
        }
        Err(InvokeError::Transport(
            format!("redirect limit of {MAX_REDIRECTS} exceeded").into(),
        ))
    }
}

#[async_trait]
impl Client for HyperClient {
    async fn execute(&self, request: Request, options: &Options) -> Result<Response, InvokeError> {
        let limit = options.read_timeout;
        match tokio::time::timeout(limit, self.execute_following(request, options)).await {
            Ok(result) => result,
            Err(_) => Err(InvokeError::Timeout(limit)),
        }
    }
}

fn resolve_location(current: &Uri, location: &str) -> Result<Uri, InvokeError> {
    let target = if location.starts_with("http://") || location.starts_with("https://") {
        location.to_owned()
    } else {
        let scheme = current.scheme_str().unwrap_or("http");
        let authority = current
            .authority()
            .map(http::uri::Authority::as_str)
            .unwrap_or_default();
        let path = if location.starts_with('/') {
            location.to_owned()
        } else {
            // Relative reference: replace the last segment of the current path.
            let base = current.path();
            let dir = base.rsplit_once('/').map_or("", |(d, _)| d);
            format!("{dir}/{location}")
        };
        format!("{scheme}://{authority}{path}")
    };
    target.parse().map_err(|e: http::uri::InvalidUri| InvokeError::InvalidUri {
        url: target,
        reason: e.to_string(),
    })
}

/// Configures connection pooling and transport limits for [`HyperClient`].
#[derive(Debug, Clone)]
pub struct HyperClientBuilder {
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    max_body_size: usize,
    user_agent: String,
}

impl Default for HyperClientBuilder {
    fn default() -> Self {
        HyperClientBuilder {
            connect_timeout: Options::default().connect_timeout,
            pool_idle_timeout: Duration::from_secs(90),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl HyperClientBuilder {
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    /// Cap on buffered response bodies.
    #[must_use]
    pub fn max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn build(self) -> HyperClient {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(self.connect_timeout));
        connector.set_nodelay(true);
        let inner = PooledClient::builder(TokioExecutor::new())
            .pool_idle_timeout(self.pool_idle_timeout)
            .build(connector);
        let user_agent = HeaderValue::from_str(&self.user_agent)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_USER_AGENT));
        HyperClient {
            inner,
            user_agent,
            max_body_size: self.max_body_size,
        }
    }
}
