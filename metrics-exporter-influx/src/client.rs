use std::{future::Future, time::Duration};

use http_body_util::{BodyExt, Collected, Full};
use hyper::{
    body::{Bytes, Incoming},
    header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Method, Request, Response, Uri,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client as HyperClient},
    rt::TokioExecutor,
};
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use crate::point::{self, Point};

/// Default time allowed for a single request, including reading the response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Errors that could occur while talking to InfluxDB.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The endpoint cannot have API paths appended to it.
    #[error("endpoint '{0}' cannot be used as a base URL")]
    InvalidEndpoint(Url),

    /// The token cannot be sent as an HTTP header value.
    #[error("token contains characters not allowed in an HTTP header")]
    InvalidToken,

    /// The request URI could not be built.
    #[error("invalid request URI: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),

    /// The request could not be built.
    #[error("failed to build request: {0}")]
    InvalidRequest(#[from] hyper::http::Error),

    /// The request could not be sent, or no response was received.
    #[error("failed to send request: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    /// No response was received within the request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The server responded with a non-successful status.
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,

        /// Response body, if it could be read.
        body: String,
    },
}

/// A client for the InfluxDB write and readiness APIs.
pub trait Client: Send + Sync {
    /// Checks whether the server is ready to accept writes.
    ///
    /// # Errors
    ///
    /// If the server could not be reached, or is not ready, an error is returned.
    fn ready(&self) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Writes the given points to `bucket` within `org`, waiting until the server has acknowledged them.
    ///
    /// # Errors
    ///
    /// If the points could not be written, an error is returned.
    fn write(
        &self,
        org: &str,
        bucket: &str,
        points: &[Point],
    ) -> impl Future<Output = Result<(), ClientError>> + Send;
}

/// Creates clients bound to an endpoint and token.
///
/// The exporter calls this once at startup, and again each time a liveness check fails, to replace its client.
pub trait ClientFactory: Send + Sync {
    /// Client type created by this factory.
    type Client: Client;

    /// Creates a new client for the given endpoint and token.
    ///
    /// # Errors
    ///
    /// If the client could not be created, an error is returned.
    fn create(&self, endpoint: &Url, token: &str) -> Result<Self::Client, ClientError>;
}

impl<F, C> ClientFactory for F
where
    F: Fn(&Url, &str) -> Result<C, ClientError> + Send + Sync,
    C: Client,
{
    type Client = C;

    fn create(&self, endpoint: &Url, token: &str) -> Result<C, ClientError> {
        self(endpoint, token)
    }
}

/// Factory for [`HttpClient`].
#[derive(Clone, Copy, Debug)]
pub struct HttpClientFactory {
    timeout: Duration,
}

impl HttpClientFactory {
    /// Sets the request timeout of the clients created by this factory.
    ///
    /// Defaults to [`DEFAULT_REQUEST_TIMEOUT`].
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for HttpClientFactory {
    fn default() -> Self {
        Self { timeout: DEFAULT_REQUEST_TIMEOUT }
    }
}

impl ClientFactory for HttpClientFactory {
    type Client = HttpClient;

    fn create(&self, endpoint: &Url, token: &str) -> Result<HttpClient, ClientError> {
        Ok(HttpClient::new(endpoint, token)?.with_timeout(self.timeout))
    }
}

/// HTTP client for InfluxDB's v2 API.
///
/// Points are sent in line protocol to `/api/v2/write` with nanosecond precision, and readiness is checked against
/// `/ready`. Both plain HTTP and HTTPS endpoints are supported.
///
/// Requests that are not answered within the request timeout fail with [`ClientError::Timeout`].
pub struct HttpClient {
    inner: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    endpoint: Url,
    authorization: HeaderValue,
    timeout: Duration,
}

impl HttpClient {
    /// Creates a new `HttpClient` for the given endpoint, authenticating with `token`.
    ///
    /// # Errors
    ///
    /// If the endpoint cannot be used as a base URL, or the token is not a valid header value, an error is returned.
    pub fn new(endpoint: &Url, token: &str) -> Result<Self, ClientError> {
        if endpoint.cannot_be_a_base() {
            return Err(ClientError::InvalidEndpoint(endpoint.clone()));
        }

        let builder = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                debug!(error = %e, "No native root certificates found, falling back to bundled roots.");
                HttpsConnectorBuilder::new().with_webpki_roots()
            }
        };
        let https = builder.https_or_http().enable_http1().build();
        let inner = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(https);

        let mut authorization =
            HeaderValue::from_str(&format!("Token {token}")).map_err(|_| ClientError::InvalidToken)?;
        authorization.set_sensitive(true);

        Ok(Self { inner, endpoint: endpoint.clone(), authorization, timeout: DEFAULT_REQUEST_TIMEOUT })
    }

    /// Sets the time allowed for each request, including reading the response.
    ///
    /// Defaults to [`DEFAULT_REQUEST_TIMEOUT`].
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn api_url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::InvalidEndpoint(self.endpoint.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<(), ClientError> {
        tokio::time::timeout(self.timeout, self.round_trip(request))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
    }

    async fn round_trip(&self, request: Request<Full<Bytes>>) -> Result<(), ClientError> {
        let response = self.inner.request(request).await?;
        if response.status().is_success() {
            return Ok(());
        }

        Err(unexpected_status(response).await)
    }
}

async fn unexpected_status(response: Response<Incoming>) -> ClientError {
    let status = response.status().as_u16();
    let body = response
        .into_body()
        .collect()
        .await
        .map(Collected::to_bytes)
        .map_err(|_| ())
        .and_then(|b| String::from_utf8(b[..].to_vec()).map_err(|_| ()))
        .unwrap_or_else(|()| String::from("<failed to read response body>"));

    ClientError::UnexpectedStatus { status, body }
}

impl Client for HttpClient {
    async fn ready(&self) -> Result<(), ClientError> {
        let url = self.api_url(&["ready"])?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(url.as_str().parse::<Uri>()?)
            .body(Full::default())?;

        self.send(request).await
    }

    async fn write(&self, org: &str, bucket: &str, points: &[Point]) -> Result<(), ClientError> {
        let mut url = self.api_url(&["api", "v2", "write"])?;
        url.query_pairs_mut()
            .append_pair("org", org)
            .append_pair("bucket", bucket)
            .append_pair("precision", "ns");

        let (payload, lines) = point::encode(points);
        trace!(lines, bytes = payload.len(), "Writing points.");

        let request = Request::builder()
            .method(Method::POST)
            .uri(url.as_str().parse::<Uri>()?)
            .header(AUTHORIZATION, self.authorization.clone())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Full::from(payload))?;

        self.send(request).await
    }
}
