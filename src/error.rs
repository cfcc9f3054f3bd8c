use std::sync::Arc;

use http::{Method, StatusCode};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    SerializeQuery,
    RequestBuild,
    Transport,
    ReadBody,
    ResponseBodyTooLarge,
    HttpStatus,
    Classified,
    Deserialize,
    Refresh,
    RefreshRetriesExhausted,
    Cancelled,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::RequestBuild => "request_build",
            Self::Transport => "transport",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::HttpStatus => "http_status",
            Self::Classified => "classified",
            Self::Deserialize => "deserialize",
            Self::Refresh => "refresh",
            Self::RefreshRetriesExhausted => "refresh_retries_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to read response body for {method} {uri}: {source}")]
    ReadBody {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error(
        "response body too large ({actual_bytes} bytes > {limit_bytes} bytes) for {method} {uri}"
    )]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("http status error {status_line} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        status_line: String,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("request failed with status {status}: {source}")]
    Classified {
        status: u16,
        #[source]
        source: BoxError,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("token refresh failed: {source}")]
    Refresh {
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    #[error("gave up after {refreshes} token refreshes: {last}")]
    RefreshRetriesExhausted {
        refreshes: usize,
        #[source]
        last: Box<Error>,
    },
    #[error("request was cancelled")]
    Cancelled,
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Serialize { .. } => ErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Classified { .. } => ErrorCode::Classified,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::Refresh { .. } => ErrorCode::Refresh,
            Self::RefreshRetriesExhausted { .. } => ErrorCode::RefreshRetriesExhausted,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Transport failures and unsuccessful statuses may be cured by a token
    /// refresh; everything else is surfaced as is.
    pub const fn is_refreshable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::ReadBody { .. }
                | Self::HttpStatus { .. }
                | Self::Classified { .. }
        )
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } | Self::Classified { status, .. } => {
                StatusCode::from_u16(*status).ok()
            }
            _ => None,
        }
    }

    /// Returns the error produced by the error classifier, if it has type `E`.
    pub fn domain_error<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Classified { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Wraps a refresh failure, for custom [`TokenRefresher`](crate::TokenRefresher)
    /// implementations.
    pub fn refresh(source: impl Into<BoxError>) -> Self {
        let source: BoxError = source.into();
        Self::Refresh {
            source: Arc::from(source),
        }
    }
}
