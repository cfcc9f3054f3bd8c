use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio::time::timeout;

#[cfg(feature = "tls-rustls-ring")]
use hyper_rustls::HttpsConnectorBuilder;

use crate::body::{ReqBody, RespBody, boxed_resp_body};
use crate::error::{BoxError, TransportErrorKind};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

pub type TransportRequest = http::Request<ReqBody>;
pub type TransportResponse = http::Response<RespBody>;
pub type TransportFuture =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send>>;

/// Failure to complete an exchange: no response head was received.
#[derive(Debug, Error)]
#[error("{kind} transport failure: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn into_source(self) -> BoxError {
        self.source
    }
}

/// Issues one byte-level exchange. Dropping the returned future cancels it.
pub trait Transport: Send + Sync {
    fn send(&self, request: TransportRequest) -> TransportFuture;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn send(&self, request: TransportRequest) -> TransportFuture {
        (**self).send(request)
    }
}

/// Hook around the network exchange, able to replace request and response
/// bodies.
pub trait NetworkInterceptor: Send + Sync {
    fn intercept_request(&self, request: TransportRequest) -> TransportRequest {
        request
    }

    fn intercept_response(&self, response: TransportResponse) -> TransportResponse {
        response
    }
}

/// Call-scoped view of a shared transport with extra interceptors.
///
/// Requests pass the interceptors in insertion order, responses in reverse
/// order. The base transport is never modified.
#[derive(Clone)]
pub struct InterceptedTransport {
    base: Arc<dyn Transport>,
    interceptors: Vec<Arc<dyn NetworkInterceptor>>,
}

impl InterceptedTransport {
    pub fn new(base: Arc<dyn Transport>) -> Self {
        Self {
            base,
            interceptors: Vec::new(),
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn NetworkInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn interceptor_count(&self) -> usize {
        self.interceptors.len()
    }
}

impl Transport for InterceptedTransport {
    fn send(&self, request: TransportRequest) -> TransportFuture {
        let request = self
            .interceptors
            .iter()
            .fold(request, |request, interceptor| {
                interceptor.intercept_request(request)
            });
        let dispatch = self.base.send(request);
        let interceptors = self.interceptors.clone();
        Box::pin(async move {
            let response = dispatch.await?;
            Ok(interceptors
                .iter()
                .rev()
                .fold(response, |response, interceptor| {
                    interceptor.intercept_response(response)
                }))
        })
    }
}

#[derive(Clone)]
enum TransportClient {
    Http(Client<HttpConnector, ReqBody>),
    #[cfg(feature = "tls-rustls-ring")]
    Https(Client<hyper_rustls::HttpsConnector<HttpConnector>, ReqBody>),
}

impl TransportClient {
    async fn request(
        &self,
        request: TransportRequest,
    ) -> Result<http::Response<hyper::body::Incoming>, hyper_util::client::legacy::Error> {
        match self {
            Self::Http(client) => client.request(request).await,
            #[cfg(feature = "tls-rustls-ring")]
            Self::Https(client) => client.request(request).await,
        }
    }
}

/// Default [`Transport`] on top of the hyper connection pool.
#[derive(Clone)]
pub struct HyperTransport {
    client: TransportClient,
    request_timeout: Option<Duration>,
}

impl HyperTransport {
    pub fn builder() -> HyperTransportBuilder {
        HyperTransportBuilder::default()
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: TransportRequest) -> TransportFuture {
        let client = self.client.clone();
        let request_timeout = self.request_timeout;
        Box::pin(async move {
            let dispatch = client.request(request);
            let response = match request_timeout {
                Some(request_timeout) => timeout(request_timeout, dispatch)
                    .await
                    .map_err(|elapsed| TransportError::new(TransportErrorKind::Timeout, elapsed))?,
                None => dispatch.await,
            }
            .map_err(|source| TransportError::new(classify_transport_error(&source), source))?;
            Ok(response.map(boxed_resp_body))
        })
    }
}

#[derive(Clone, Debug)]
pub struct HyperTransportBuilder {
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
}

impl Default for HyperTransportBuilder {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
        }
    }
}

impl HyperTransportBuilder {
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Upper bound for receiving the response head. Body reads are not
    /// covered.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host;
        self
    }

    pub fn build(self) -> HyperTransport {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(self.connect_timeout));
        connector.set_nodelay(true);
        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_idle_timeout(self.pool_idle_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host);

        #[cfg(feature = "tls-rustls-ring")]
        let client = {
            connector.enforce_http(false);
            let https = HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .wrap_connector(connector);
            TransportClient::Https(builder.build(https))
        };
        #[cfg(not(feature = "tls-rustls-ring"))]
        let client = TransportClient::Http(builder.build(connector));

        HyperTransport {
            client,
            request_timeout: self.request_timeout,
        }
    }
}

pub(crate) fn classify_transport_error(
    error: &hyper_util::client::legacy::Error,
) -> TransportErrorKind {
    if error.is_connect() {
        let text = error.to_string().to_ascii_lowercase();
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    let text = error.to_string().to_ascii_lowercase();
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}
