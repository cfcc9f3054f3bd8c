use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{BoxError, Error};
use crate::util::{status_line, truncate_body};

/// A response with an unsuccessful status, body already buffered.
#[derive(Clone, Debug)]
pub struct FailedResponse {
    method: Method,
    uri: String,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl FailedResponse {
    pub(crate) fn new(
        method: Method,
        uri: String,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        Self {
            method,
            uri,
            status,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request uri with query and credentials removed.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decodes the error payload; `None` when it is not the expected shape.
    pub fn json<T>(&self) -> Option<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Maps a failed response to a domain error.
///
/// Returning `None` falls back to [`Error::HttpStatus`] carrying the status
/// line. Classification runs on every unsuccessful attempt, before the token
/// refresher sees the error.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, response: &FailedResponse) -> Option<BoxError>;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&FailedResponse) -> Option<BoxError> + Send + Sync,
{
    fn classify(&self, response: &FailedResponse) -> Option<BoxError> {
        self(response)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StatusOnlyClassifier;

impl ErrorClassifier for StatusOnlyClassifier {
    fn classify(&self, _response: &FailedResponse) -> Option<BoxError> {
        None
    }
}

pub(crate) fn classify_failure(
    classifier: &dyn ErrorClassifier,
    response: FailedResponse,
) -> Error {
    match classifier.classify(&response) {
        Some(source) => Error::Classified {
            status: response.status.as_u16(),
            source,
        },
        None => Error::HttpStatus {
            status: response.status.as_u16(),
            status_line: status_line(response.status),
            body: truncate_body(&response.body),
            method: response.method,
            uri: response.uri,
        },
    }
}
