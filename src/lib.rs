//! `reqpipe` is the request-processing core for API SDKs: it dispatches
//! assembled requests, retries exactly the ones rejected for an expired token
//! after a single-flight refresh, and reports upload/download progress as a
//! stream. Every call is cancellable.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use reqpipe::prelude::{HyperTransport, RequestProcessor, Service, StaticHost};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: u64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let processor = RequestProcessor::builder(Arc::new(HyperTransport::default()))
//!         .client_name("my-sdk")
//!         .build();
//!     let api = Service::new(processor, StaticHost::https("api.example.com"));
//!
//!     let item: Item = api.get("/v1/items/1").single().await?;
//!     println!("item id={}", item.id);
//!     Ok(())
//! }
//! ```
//!
//! # Token refresh
//!
//! Plug a [`SharedTokenRefresher`] into the processor builder. Calls failing
//! with a refreshable error wait for one shared refresh and are dispatched
//! again, up to [`ProcessorConfig::max_refresh_retries`] rounds.

mod body;
mod call;
mod classify;
mod config;
mod error;
mod interceptor;
mod metrics;
mod processor;
mod progress;
mod refresh;
mod request;
mod service;
mod transport;
mod util;

pub use crate::body::{
    BodyStream, ReqBody, RequestBody, RespBody, boxed_resp_body, buffered_req_body,
    empty_req_body, stream_req_body,
};
pub use crate::call::{Call, CancelHandle, ProgressStream};
pub use crate::classify::{ErrorClassifier, FailedResponse, StatusOnlyClassifier};
pub use crate::config::{
    DEFAULT_CLIENT_NAME, DEFAULT_MAX_REFRESH_RETRIES, DEFAULT_MAX_RESPONSE_BODY_BYTES,
    ProcessorConfig,
};
pub use crate::error::{BoxError, Error, ErrorCode, TransportErrorKind};
pub use crate::interceptor::{DownloadProgressInterceptor, UploadProgressInterceptor};
pub use crate::metrics::ProcessorMetricsSnapshot;
pub use crate::processor::{CallMode, RequestProcessor, RequestProcessorBuilder};
pub use crate::progress::{Progress, ProgressBody, ProgressListener, ProgressWithResult, Transfer};
pub use crate::refresh::{NoopTokenRefresher, RefreshToken, SharedTokenRefresher, TokenRefresher};
pub use crate::request::{Request, RequestBuilder};
pub use crate::service::{HostProvider, Service, ServiceRequest, StaticHost};
pub use crate::transport::{
    HyperTransport, HyperTransportBuilder, InterceptedTransport, NetworkInterceptor, Transport,
    TransportError, TransportFuture, TransportRequest, TransportResponse,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Call, CallMode, CancelHandle, Error, ErrorClassifier, ErrorCode, FailedResponse,
        HostProvider, HyperTransport, NoopTokenRefresher, ProcessorConfig, Progress,
        ProgressStream, ProgressWithResult, RefreshToken, Request, RequestBody, RequestBuilder,
        RequestProcessor, Service, SharedTokenRefresher, StaticHost, TokenRefresher, Transfer,
        Transport,
    };
}
