use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use serde::Serialize;

use crate::body::{RequestBody, empty_req_body};
use crate::error::Error;
use crate::transport::TransportRequest;
use crate::util::{
    append_query, join_base_path, merge_headers, parse_header_name, parse_header_value,
};

const DEFAULT_SCHEME: &str = "https";

/// A fully assembled request. Never modified once handed to the processor.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<RequestBody>,
}

impl Request {
    /// `uri` must be absolute (`http` or `https`).
    pub fn new(method: Method, uri: &str) -> Result<Self, Error> {
        Ok(Self {
            method,
            uri: parse_absolute_uri(uri)?,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    pub fn builder(method: Method) -> RequestBuilder {
        RequestBuilder::new(method)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_with_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.with_header(name, value))
    }

    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    /// Builds one attempt's wire request. Called again for every refresh
    /// retry, which replays the body.
    pub(crate) fn to_transport_request(
        &self,
        default_headers: &HeaderMap,
    ) -> Result<TransportRequest, Error> {
        let mut headers = merge_headers(default_headers, &self.headers);
        let body = match &self.body {
            Some(body) => {
                if let Some(content_type) = body.content_type() {
                    headers
                        .entry(CONTENT_TYPE)
                        .or_insert_with(|| content_type.clone());
                }
                if let Some(content_length) = body.content_length() {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
                }
                body.to_req_body()
            }
            None => empty_req_body(),
        };

        let mut builder = http::Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone());
        if let Some(target) = builder.headers_mut() {
            *target = headers;
        }
        builder
            .body(body)
            .map_err(|source| Error::RequestBuild { source })
    }
}

fn parse_absolute_uri(uri: &str) -> Result<Uri, Error> {
    let invalid = || Error::InvalidUri {
        uri: uri.to_owned(),
    };
    let parsed: Uri = uri.parse().map_err(|_| invalid())?;
    let scheme_ok = matches!(parsed.scheme_str(), Some("http" | "https"));
    if !scheme_ok || parsed.authority().is_none() {
        return Err(invalid());
    }
    Ok(parsed)
}

/// Assembles a [`Request`] from scheme, host, path and query parts.
///
/// Headers are unique by name; setting one twice keeps the last value.
#[derive(Clone, Debug)]
pub struct RequestBuilder {
    method: Method,
    scheme: String,
    host: String,
    path: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<RequestBody>,
}

impl RequestBuilder {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            scheme: DEFAULT_SCHEME.to_owned(),
            host: String::new(),
            path: String::new(),
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Host with optional port, e.g. `api.example.com:8443`.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query<T>(mut self, params: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded =
            serde_urlencoded::to_string(params).map_err(|source| Error::SerializeQuery { source })?;
        self.query_pairs.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T>(mut self, payload: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        self.body = Some(RequestBody::json(payload)?);
        Ok(self)
    }

    pub fn build(self) -> Result<Request, Error> {
        let origin = format!("{}://{}", self.scheme, self.host);
        let encoded_query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query_pairs.iter())
            .finish();
        let uri = append_query(&join_base_path(&origin, &self.path), &encoded_query);

        let mut request = Request::new(self.method, &uri)?;
        request.headers = self.headers;
        request.body = self.body;
        Ok(request)
    }
}
