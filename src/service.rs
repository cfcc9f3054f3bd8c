use std::sync::Arc;

use http::Method;
use http::header::{HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::body::RequestBody;
use crate::call::{Call, ProgressStream};
use crate::error::Error;
use crate::processor::RequestProcessor;
use crate::progress::{Progress, ProgressWithResult};
use crate::request::{Request, RequestBuilder};

/// Where a service's requests go. Consulted once per request, so a provider
/// may switch hosts at runtime.
pub trait HostProvider: Send + Sync {
    fn scheme(&self) -> &str {
        "https"
    }

    fn host(&self) -> &str;
}

#[derive(Clone, Debug)]
pub struct StaticHost {
    scheme: String,
    host: String,
}

impl StaticHost {
    pub fn https(host: impl Into<String>) -> Self {
        Self {
            scheme: "https".to_owned(),
            host: host.into(),
        }
    }

    pub fn http(host: impl Into<String>) -> Self {
        Self {
            scheme: "http".to_owned(),
            host: host.into(),
        }
    }
}

impl HostProvider for StaticHost {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// An API surface: one host plus a processor.
#[derive(Clone)]
pub struct Service {
    processor: RequestProcessor,
    hosts: Arc<dyn HostProvider>,
}

impl Service {
    pub fn new<H>(processor: RequestProcessor, hosts: H) -> Self
    where
        H: HostProvider + 'static,
    {
        Self {
            processor,
            hosts: Arc::new(hosts),
        }
    }

    pub fn processor(&self) -> &RequestProcessor {
        &self.processor
    }

    pub fn request(&self, method: Method, path: &str) -> ServiceRequest {
        let builder = RequestBuilder::new(method)
            .scheme(self.hosts.scheme())
            .host(self.hosts.host())
            .path(path);
        ServiceRequest {
            processor: self.processor.clone(),
            builder: Ok(builder),
        }
    }

    pub fn get(&self, path: &str) -> ServiceRequest {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> ServiceRequest {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> ServiceRequest {
        self.request(Method::PUT, path)
    }

    pub fn delete(&self, path: &str) -> ServiceRequest {
        self.request(Method::DELETE, path)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Service")
            .field("scheme", &self.hosts.scheme())
            .field("host", &self.hosts.host())
            .finish_non_exhaustive()
    }
}

/// A request being assembled against a [`Service`].
///
/// Assembly errors are kept until a terminal method runs; the returned handle
/// then fails with them without dispatching.
#[must_use = "requests do nothing until a terminal method is called"]
pub struct ServiceRequest {
    processor: RequestProcessor,
    builder: Result<RequestBuilder, Error>,
}

impl ServiceRequest {
    fn map(mut self, apply: impl FnOnce(RequestBuilder) -> Result<RequestBuilder, Error>) -> Self {
        self.builder = self.builder.and_then(apply);
        self
    }

    pub fn header(self, name: HeaderName, value: HeaderValue) -> Self {
        self.map(|builder| Ok(builder.header(name, value)))
    }

    pub fn try_header(self, name: &str, value: &str) -> Self {
        self.map(|builder| builder.try_header(name, value))
    }

    pub fn query_pair(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.map(|builder| Ok(builder.query_pair(name, value)))
    }

    pub fn query<T>(self, params: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        self.map(|builder| builder.query(params))
    }

    pub fn body(self, body: impl Into<RequestBody>) -> Self {
        self.map(|builder| Ok(builder.body(body)))
    }

    pub fn json<T>(self, payload: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        self.map(|builder| builder.json(payload))
    }

    pub fn build(self) -> Result<Request, Error> {
        self.builder?.build()
    }

    fn into_parts(self) -> (RequestProcessor, Result<Request, Error>) {
        let request = self.builder.and_then(RequestBuilder::build);
        (self.processor, request)
    }

    pub fn single<T>(self) -> Call<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        match self.into_parts() {
            (processor, Ok(request)) => processor.process(request),
            (_, Err(error)) => Call::failed(error),
        }
    }

    pub fn completable(self) -> Call<()> {
        match self.into_parts() {
            (processor, Ok(request)) => processor.process_completable(request),
            (_, Err(error)) => Call::failed(error),
        }
    }

    pub fn progress(self) -> ProgressStream<Progress> {
        match self.into_parts() {
            (processor, Ok(request)) => processor.process_with_progress(request),
            (_, Err(error)) => ProgressStream::failed(error),
        }
    }

    pub fn progress_with_result<T>(self) -> ProgressStream<ProgressWithResult<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        match self.into_parts() {
            (processor, Ok(request)) => processor.process_with_progress_result(request),
            (_, Err(error)) => ProgressStream::failed(error),
        }
    }
}

impl std::fmt::Debug for ServiceRequest {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ServiceRequest")
            .field("builder", &self.builder)
            .finish_non_exhaustive()
    }
}
