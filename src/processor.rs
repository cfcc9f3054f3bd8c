use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http::Method;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::body::{ReadBodyError, RespBody, drain_body, read_all_body_limited};
use crate::call::{Call, ProgressEmitter, ProgressStream, until_cancelled};
use crate::classify::{ErrorClassifier, FailedResponse, StatusOnlyClassifier, classify_failure};
use crate::config::ProcessorConfig;
use crate::error::{Error, ErrorCode};
use crate::interceptor::{DownloadProgressInterceptor, UploadProgressInterceptor};
use crate::metrics::{ProcessorMetrics, ProcessorMetricsSnapshot};
use crate::progress::{Progress, ProgressEvent, ProgressWithResult};
use crate::refresh::{NoopTokenRefresher, TokenRefresher};
use crate::request::Request;
use crate::transport::{InterceptedTransport, Transport};
use crate::util::{redact_uri_for_logs, truncate_body};

/// The shape of a call's result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallMode {
    /// One decoded value.
    Single,
    /// Success or failure, no value.
    Completable,
    /// Transfer events, then `Progress::Complete`.
    Progress,
    /// Transfer events, then the decoded value.
    ProgressWithResult,
}

impl CallMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Completable => "completable",
            Self::Progress => "progress",
            Self::ProgressWithResult => "progress_with_result",
        }
    }

    pub const fn reports_progress(self) -> bool {
        matches!(self, Self::Progress | Self::ProgressWithResult)
    }
}

impl std::fmt::Display for CallMode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Runs requests through the transport with token-refresh retries.
///
/// Every call is processed on its own tokio task and observed through the
/// returned [`Call`] or [`ProgressStream`]. Cloning is cheap; clones share
/// the transport, refresher and metrics.
#[derive(Clone)]
pub struct RequestProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    transport: Arc<dyn Transport>,
    refresher: Arc<dyn TokenRefresher>,
    classifier: Arc<dyn ErrorClassifier>,
    config: ProcessorConfig,
    metrics: ProcessorMetrics,
}

pub struct RequestProcessorBuilder {
    transport: Arc<dyn Transport>,
    refresher: Arc<dyn TokenRefresher>,
    classifier: Arc<dyn ErrorClassifier>,
    config: ProcessorConfig,
}

impl RequestProcessorBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            refresher: Arc::new(NoopTokenRefresher),
            classifier: Arc::new(StatusOnlyClassifier),
            config: ProcessorConfig::default(),
        }
    }

    pub fn token_refresher<R>(mut self, refresher: R) -> Self
    where
        R: TokenRefresher + 'static,
    {
        self.refresher = Arc::new(refresher);
        self
    }

    pub fn error_classifier<C>(mut self, classifier: C) -> Self
    where
        C: ErrorClassifier + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.config.client_name = client_name.into();
        self
    }

    pub fn build(self) -> RequestProcessor {
        RequestProcessor {
            inner: Arc::new(ProcessorInner {
                transport: self.transport,
                refresher: self.refresher,
                classifier: self.classifier,
                config: self.config,
                metrics: ProcessorMetrics::default(),
            }),
        }
    }
}

impl RequestProcessor {
    pub fn builder(transport: Arc<dyn Transport>) -> RequestProcessorBuilder {
        RequestProcessorBuilder::new(transport)
    }

    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::builder(transport).build()
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    pub fn metrics_snapshot(&self) -> ProcessorMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Dispatches `request` and decodes the response body as JSON.
    pub fn process<T>(&self, request: Request) -> Call<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.spawn_call(request, CallMode::Single, read_json::<T>)
    }

    /// Dispatches `request`; the body of a successful response is discarded.
    pub fn process_completable(&self, request: Request) -> Call<()> {
        self.spawn_call(request, CallMode::Completable, discard)
    }

    /// Dispatches `request` reporting upload and download progress.
    pub fn process_with_progress(&self, request: Request) -> ProgressStream<Progress> {
        self.spawn_progress(request, CallMode::Progress, |context, body| async move {
            drain(context, body).await.map(|()| Progress::Complete)
        })
    }

    /// Like [`process_with_progress`](Self::process_with_progress), ending
    /// with the decoded response body.
    pub fn process_with_progress_result<T>(
        &self,
        request: Request,
    ) -> ProgressStream<ProgressWithResult<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.spawn_progress(
            request,
            CallMode::ProgressWithResult,
            |context, body| async move {
                read_json::<T>(context, body)
                    .await
                    .map(ProgressWithResult::Complete)
            },
        )
    }

    fn spawn_call<T, D, Fut>(&self, request: Request, mode: CallMode, decode: D) -> Call<T>
    where
        T: Send + 'static,
        D: Fn(ResponseContext, RespBody) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let inner = Arc::clone(&self.inner);
        Call::spawn(token, async move {
            let _in_flight = inner.metrics.enter_call();
            let pipeline = inner.execute(&request, mode, &*inner.transport, decode);
            let Some(outcome) = until_cancelled(&task_token, pipeline).await else {
                inner.metrics.record_cancelled();
                debug!(mode = mode.as_str(), "call cancelled");
                return Err(Error::Cancelled);
            };
            if task_token.is_cancelled() {
                inner.metrics.record_cancelled();
                if let Err(error) = &outcome {
                    debug!(
                        error = %error,
                        mode = mode.as_str(),
                        "dropping failure of cancelled call"
                    );
                }
                return Err(Error::Cancelled);
            }
            inner.metrics.record_call_completed(&outcome);
            outcome
        })
    }

    fn spawn_progress<E, D, Fut>(
        &self,
        request: Request,
        mode: CallMode,
        decode: D,
    ) -> ProgressStream<E>
    where
        E: ProgressEvent,
        D: Fn(ResponseContext, RespBody) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<E, Error>> + Send + 'static,
    {
        let (emitter, events) = ProgressEmitter::channel();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let inner = Arc::clone(&self.inner);
        ProgressStream::spawn(events, token, async move {
            let _in_flight = inner.metrics.enter_call();
            let transport = InterceptedTransport::new(Arc::clone(&inner.transport))
                .with_interceptor(Arc::new(UploadProgressInterceptor::new(
                    emitter.upload_listener(),
                )))
                .with_interceptor(Arc::new(DownloadProgressInterceptor::new(
                    emitter.download_listener(),
                )));
            let pipeline = inner.execute(&request, mode, &transport, decode);
            let Some(outcome) = until_cancelled(&task_token, pipeline).await else {
                inner.metrics.record_cancelled();
                emitter.close();
                debug!(mode = mode.as_str(), "call cancelled");
                return;
            };
            if task_token.is_cancelled() {
                inner.metrics.record_cancelled();
                emitter.close();
                if let Err(error) = &outcome {
                    debug!(
                        error = %error,
                        mode = mode.as_str(),
                        "dropping failure of cancelled call"
                    );
                }
                return;
            }
            inner.metrics.record_call_completed(&outcome);
            let failure = outcome.as_ref().err().map(ToString::to_string);
            if !emitter.finish(outcome)
                && let Some(failure) = failure
            {
                debug!(
                    error = %failure,
                    mode = mode.as_str(),
                    "dropping failure of cancelled call"
                );
            }
        })
    }
}

impl std::fmt::Debug for RequestProcessor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestProcessor")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ProcessorInner {
    /// The refresh retry loop: `ready`, attempt, and on a refreshable failure
    /// `try_refresh` followed by a fresh round.
    async fn execute<T, D, Fut>(
        &self,
        request: &Request,
        mode: CallMode,
        transport: &dyn Transport,
        decode: D,
    ) -> Result<T, Error>
    where
        D: Fn(ResponseContext, RespBody) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, Error>> + Send,
    {
        let mut refreshes = 0_usize;
        loop {
            self.refresher.ready().await?;

            let error = match self
                .attempt(request, mode, refreshes + 1, transport, &decode)
                .await
            {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !error.is_refreshable() {
                return Err(error);
            }
            if let Some(limit) = self.config.max_refresh_retries
                && refreshes >= limit
            {
                warn!(refreshes, error = %error, "giving up after repeated token refreshes");
                return Err(Error::RefreshRetriesExhausted {
                    refreshes,
                    last: Box::new(error),
                });
            }

            self.metrics.record_refresh_attempt();
            if let Err(error) = self.refresher.try_refresh(error).await {
                if error.code() == ErrorCode::Refresh {
                    self.metrics.record_refresh_failure();
                }
                return Err(error);
            }
            refreshes += 1;
            warn!(mode = mode.as_str(), refreshes, "token refreshed; retrying request");
        }
    }

    async fn attempt<T, D, Fut>(
        &self,
        request: &Request,
        mode: CallMode,
        attempt: usize,
        transport: &dyn Transport,
        decode: &D,
    ) -> Result<T, Error>
    where
        D: Fn(ResponseContext, RespBody) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, Error>> + Send,
    {
        let uri = redact_uri_for_logs(&request.uri().to_string());
        let span = info_span!(
            "reqpipe.request",
            client = %self.config.client_name,
            mode = mode.as_str(),
            progress = mode.reports_progress(),
            method = %request.method(),
            uri = %uri,
            attempt
        );

        async {
            let wire_request = request.to_transport_request(&self.config.default_headers)?;
            self.metrics.record_dispatch();
            debug!("dispatching request");

            let response = transport.send(wire_request).await.map_err(|error| {
                debug!(kind = %error.kind(), "transport failure");
                Error::Transport {
                    kind: error.kind(),
                    method: request.method().clone(),
                    uri: uri.clone(),
                    source: error.into_source(),
                }
            })?;

            let (parts, body) = response.into_parts();
            let status = parts.status;
            let context = ResponseContext {
                method: request.method().clone(),
                uri: uri.clone(),
                max_response_body_bytes: self.config.max_response_body_bytes,
            };

            if !status.is_success() {
                let error_body = match read_all_body_limited(body, context.max_response_body_bytes)
                    .await
                {
                    Ok(error_body) => error_body,
                    Err(_) => {
                        debug!("failed to read error response body");
                        Bytes::new()
                    }
                };
                let failed = FailedResponse::new(
                    context.method,
                    context.uri,
                    status,
                    parts.headers,
                    error_body,
                );
                let error = classify_failure(self.classifier.as_ref(), failed);
                debug!(
                    status = status.as_u16(),
                    code = error.code().as_str(),
                    "request failed"
                );
                return Err(error);
            }

            let value = decode(context, body).await?;
            debug!(status = status.as_u16(), "request completed");
            Ok(value)
        }
        .instrument(span)
        .await
    }
}

/// What a response decoder needs to describe its failures.
pub(crate) struct ResponseContext {
    method: Method,
    uri: String,
    max_response_body_bytes: usize,
}

impl ResponseContext {
    fn read_error(&self, error: ReadBodyError) -> Error {
        match error {
            ReadBodyError::Read(source) => Error::ReadBody {
                method: self.method.clone(),
                uri: self.uri.clone(),
                source,
            },
            ReadBodyError::TooLarge { actual_bytes } => Error::ResponseBodyTooLarge {
                limit_bytes: self.max_response_body_bytes,
                actual_bytes,
                method: self.method.clone(),
                uri: self.uri.clone(),
            },
        }
    }
}

async fn read_json<T>(context: ResponseContext, body: RespBody) -> Result<T, Error>
where
    T: DeserializeOwned,
{
    let bytes = read_all_body_limited(body, context.max_response_body_bytes)
        .await
        .map_err(|error| context.read_error(error))?;
    serde_json::from_slice(&bytes).map_err(|source| Error::Deserialize {
        source,
        body: truncate_body(&bytes),
    })
}

async fn discard(context: ResponseContext, body: RespBody) -> Result<(), Error> {
    read_all_body_limited(body, context.max_response_body_bytes)
        .await
        .map(|_| ())
        .map_err(|error| context.read_error(error))
}

/// Reads the whole body without keeping it, so download progress covers it.
async fn drain(context: ResponseContext, body: RespBody) -> Result<(), Error> {
    drain_body(body)
        .await
        .map(|drained| debug!(drained, "response body drained"))
        .map_err(|source| Error::ReadBody {
            method: context.method,
            uri: context.uri,
            source,
        })
}
