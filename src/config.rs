use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};

use crate::error::Error;
use crate::util::{parse_header_name, parse_header_value};

pub const DEFAULT_CLIENT_NAME: &str = "reqpipe";
pub const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_MAX_REFRESH_RETRIES: usize = 8;

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Reported in every request span.
    pub client_name: String,
    pub max_response_body_bytes: usize,
    /// Refresh-and-retry rounds allowed per call. `None` retries for as long
    /// as the token refresher keeps succeeding.
    pub max_refresh_retries: Option<usize>,
    /// Sent with every request; request headers override them.
    pub default_headers: HeaderMap,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            max_refresh_retries: Some(DEFAULT_MAX_REFRESH_RETRIES),
            default_headers: HeaderMap::new(),
        }
    }
}

impl ProcessorConfig {
    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn with_max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn with_max_refresh_retries(mut self, max_refresh_retries: usize) -> Self {
        self.max_refresh_retries = Some(max_refresh_retries);
        self
    }

    pub fn with_unbounded_refresh_retries(mut self) -> Self {
        self.max_refresh_retries = None;
        self
    }

    pub fn with_default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_with_default_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.with_default_header(name, value))
    }
}
