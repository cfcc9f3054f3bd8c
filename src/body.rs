use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use http::HeaderValue;
use http_body::{Body, Frame};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use serde::Serialize;

use crate::error::{BoxError, Error};

pub type ReqBody = UnsyncBoxBody<Bytes, BoxError>;
pub type RespBody = UnsyncBoxBody<Bytes, BoxError>;

/// A fresh byte stream for one attempt of a streaming request body.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

type StreamFactory = Arc<dyn Fn() -> BodyStream + Send + Sync>;

const APPLICATION_JSON: &str = "application/json";

#[derive(Clone)]
enum BodyContent {
    Buffered(Bytes),
    Streaming(StreamFactory),
}

/// Outgoing payload of a [`Request`](crate::Request).
///
/// Bodies are replayable: a refresh retry dispatches the same request again,
/// so streaming bodies are described by a factory rather than a single stream.
#[derive(Clone)]
pub struct RequestBody {
    content: BodyContent,
    content_type: Option<HeaderValue>,
    content_length: Option<u64>,
}

impl RequestBody {
    pub fn bytes(body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let content_length = Some(body.len() as u64);
        Self {
            content: BodyContent::Buffered(body),
            content_type: None,
            content_length,
        }
    }

    pub fn json<T>(value: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value).map_err(|source| Error::Serialize { source })?;
        Ok(Self::bytes(body).with_content_type(HeaderValue::from_static(APPLICATION_JSON)))
    }

    /// Streaming body whose length may be unknown. `factory` is invoked once
    /// per dispatch attempt.
    pub fn stream<F>(content_length: Option<u64>, factory: F) -> Self
    where
        F: Fn() -> BodyStream + Send + Sync + 'static,
    {
        Self {
            content: BodyContent::Streaming(Arc::new(factory)),
            content_type: None,
            content_length,
        }
    }

    pub fn with_content_type(mut self, content_type: HeaderValue) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn content_type(&self) -> Option<&HeaderValue> {
        self.content_type.as_ref()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.content {
            BodyContent::Buffered(body) => Some(body),
            BodyContent::Streaming(_) => None,
        }
    }

    pub(crate) fn to_req_body(&self) -> ReqBody {
        match &self.content {
            BodyContent::Buffered(body) => buffered_req_body(body.clone()),
            BodyContent::Streaming(factory) => stream_req_body(factory()),
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.content {
            BodyContent::Buffered(_) => "buffered",
            BodyContent::Streaming(_) => "streaming",
        };
        formatter
            .debug_struct("RequestBody")
            .field("kind", &kind)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish()
    }
}

impl From<Bytes> for RequestBody {
    fn from(body: Bytes) -> Self {
        Self::bytes(body)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(body: Vec<u8>) -> Self {
        Self::bytes(body)
    }
}

impl From<String> for RequestBody {
    fn from(body: String) -> Self {
        Self::bytes(body)
    }
}

impl From<&'static str> for RequestBody {
    fn from(body: &'static str) -> Self {
        Self::bytes(Bytes::from_static(body.as_bytes()))
    }
}

fn map_infallible_to_box_error(never: Infallible) -> BoxError {
    match never {}
}

pub fn empty_req_body() -> ReqBody {
    Empty::<Bytes>::new()
        .map_err(map_infallible_to_box_error)
        .boxed_unsync()
}

pub fn buffered_req_body(body: impl Into<Bytes>) -> ReqBody {
    Full::new(body.into())
        .map_err(map_infallible_to_box_error)
        .boxed_unsync()
}

pub fn stream_req_body(stream: BodyStream) -> ReqBody {
    StreamBody::new(stream.map(|item| item.map(Frame::data))).boxed_unsync()
}

/// Boxes any response body so it can travel through [`Transport`](crate::Transport).
pub fn boxed_resp_body<B>(body: B) -> RespBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(|error| -> BoxError { error.into() })
        .boxed_unsync()
}

pub(crate) enum ReadBodyError {
    Read(BoxError),
    TooLarge { actual_bytes: usize },
}

pub(crate) async fn read_all_body_limited(
    mut body: RespBody,
    max_bytes: usize,
) -> Result<Bytes, ReadBodyError> {
    let mut collected = Vec::new();
    let mut total_len = 0_usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ReadBodyError::Read)?;
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(ReadBodyError::TooLarge {
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}

/// Reads the body to the end without keeping it, returning the byte count.
pub(crate) async fn drain_body(mut body: RespBody) -> Result<u64, BoxError> {
    let mut drained = 0_u64;
    while let Some(frame) = body.frame().await {
        let frame = frame?;
        if let Some(data) = frame.data_ref() {
            drained = drained.saturating_add(data.len() as u64);
        }
    }
    Ok(drained)
}
