use std::sync::Arc;

use http::HeaderMap;
use http::header::CONTENT_LENGTH;
use http_body::Body;
use http_body_util::BodyExt;

use crate::progress::{ProgressBody, ProgressListener};
use crate::transport::{NetworkInterceptor, TransportRequest, TransportResponse};

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Reports bytes written for the request body. Requests without a body pass
/// through untouched.
pub struct UploadProgressInterceptor {
    listener: Arc<dyn ProgressListener>,
}

impl UploadProgressInterceptor {
    pub fn new(listener: Arc<dyn ProgressListener>) -> Self {
        Self { listener }
    }
}

impl NetworkInterceptor for UploadProgressInterceptor {
    fn intercept_request(&self, request: TransportRequest) -> TransportRequest {
        let (parts, body) = request.into_parts();
        if body.is_end_stream() {
            return http::Request::from_parts(parts, body);
        }
        let bytes_total = declared_length(&parts.headers).or_else(|| body.size_hint().exact());
        let body = ProgressBody::new(body, bytes_total, Arc::clone(&self.listener)).boxed_unsync();
        http::Request::from_parts(parts, body)
    }
}

/// Reports bytes read from the response body.
pub struct DownloadProgressInterceptor {
    listener: Arc<dyn ProgressListener>,
}

impl DownloadProgressInterceptor {
    pub fn new(listener: Arc<dyn ProgressListener>) -> Self {
        Self { listener }
    }
}

impl NetworkInterceptor for DownloadProgressInterceptor {
    fn intercept_response(&self, response: TransportResponse) -> TransportResponse {
        let (parts, body) = response.into_parts();
        let bytes_total = declared_length(&parts.headers).or_else(|| body.size_hint().exact());
        let body = ProgressBody::new(body, bytes_total, Arc::clone(&self.listener)).boxed_unsync();
        http::Response::from_parts(parts, body)
    }
}
