use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, stream};
use http::header::CONTENT_LENGTH;
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use reqpipe::prelude::{
    CancelHandle, Error, ErrorCode, FailedResponse, Progress, ProgressWithResult, RefreshToken,
    Request, RequestBody, RequestProcessor, SharedTokenRefresher, Transfer, Transport,
};
use reqpipe::{
    BodyStream, BoxError, ProcessorConfig, TransportError, TransportErrorKind, TransportFuture,
    TransportRequest, stream_req_body,
};
use serde::Deserialize;
use serde_json::json;

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

enum Step {
    Reply {
        status: u16,
        body: Vec<u8>,
        chunk_size: usize,
    },
    Fail,
    Hang,
}

fn reply(status: u16, body: impl Into<Vec<u8>>) -> Step {
    Step::Reply {
        status,
        body: body.into(),
        chunk_size: 64,
    }
}

type Script = Box<dyn Fn(usize) -> Step + Send + Sync>;

/// Counts dispatches dropped before they produced an outcome.
struct DispatchGuard {
    abandoned: Arc<AtomicUsize>,
    finished: bool,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// In-memory transport answering the n-th dispatch with `script(n)`. Request
/// bodies are read to the end before answering, like a real connection.
struct ScriptedTransport {
    script: Script,
    dispatches: AtomicUsize,
    bodies: Arc<Mutex<Vec<Bytes>>>,
    abandoned: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    fn new(script: impl Fn(usize) -> Step + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            dispatches: AtomicUsize::new(0),
            bodies: Arc::new(Mutex::new(Vec::new())),
            abandoned: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn sequence(steps: Vec<(u16, &'static str)>) -> Arc<Self> {
        Self::new(move |index| {
            let (status, body) = steps[index.min(steps.len() - 1)];
            reply(status, body)
        })
    }

    fn dispatches(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    fn bodies(&self) -> Vec<Bytes> {
        self.bodies.lock().expect("lock bodies").clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: TransportRequest) -> TransportFuture {
        let index = self.dispatches.fetch_add(1, Ordering::SeqCst);
        let step = (self.script)(index);
        let bodies = Arc::clone(&self.bodies);
        let guard = DispatchGuard {
            abandoned: Arc::clone(&self.abandoned),
            finished: false,
        };
        Box::pin(async move {
            // Own the whole guard; capturing only `finished` would drop it early.
            let mut guard = guard;
            let uploaded = request
                .into_body()
                .collect()
                .await
                .map_err(|error| TransportError::new(TransportErrorKind::Other, error))?
                .to_bytes();
            bodies.lock().expect("lock bodies").push(uploaded);

            let (status, body, chunk_size) = match step {
                Step::Reply {
                    status,
                    body,
                    chunk_size,
                } => (status, body, chunk_size),
                Step::Fail => {
                    guard.finished = true;
                    return Err(TransportError::new(
                        TransportErrorKind::Connect,
                        "connection refused",
                    ));
                }
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    (200, Vec::new(), 1)
                }
            };
            guard.finished = true;

            let total = body.len();
            let chunks: Vec<Result<Bytes, BoxError>> = body
                .chunks(chunk_size.max(1))
                .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                .collect();
            let stream: BodyStream = Box::pin(stream::iter(chunks));
            let mut response = http::Response::new(stream_req_body(stream));
            *response.status_mut() =
                StatusCode::from_u16(status).expect("scripted status should be valid");
            response
                .headers_mut()
                .insert(CONTENT_LENGTH, http::HeaderValue::from(total));
            Ok(response)
        })
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct Item {
    id: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("access token expired")]
struct AuthExpired;

fn auth_classifier(response: &FailedResponse) -> Option<BoxError> {
    let payload: serde_json::Value = response.json()?;
    (payload["code"] == "auth_expired").then(|| -> BoxError { Box::new(AuthExpired) })
}

#[derive(Clone)]
struct TestToken {
    generation: Arc<AtomicUsize>,
    refreshes: Arc<AtomicUsize>,
    delay: Duration,
    fail: bool,
}

impl TestToken {
    fn new() -> Self {
        Self {
            generation: Arc::new(AtomicUsize::new(0)),
            refreshes: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            fail: false,
        }
    }

    fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl RefreshToken for TestToken {
    fn is_refreshable(&self, error: &Error) -> bool {
        error.domain_error::<AuthExpired>().is_some()
            || error.status() == Some(StatusCode::UNAUTHORIZED)
    }

    fn refresh(&self) -> BoxFuture<'static, Result<(), BoxError>> {
        let token = self.clone();
        async move {
            token.refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(token.delay).await;
            if token.fail {
                return Err("refresh token revoked".into());
            }
            token.generation.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }
}

fn get(path: &str) -> Request {
    Request::new(Method::GET, &format!("https://api.example.com{path}")).expect("valid uri")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_attempt_success_needs_no_refresh() {
    let transport = ScriptedTransport::sequence(vec![(200, r#"{"id":1}"#)]);
    let token = TestToken::new();
    let processor = RequestProcessor::builder(transport.clone())
        .token_refresher(SharedTokenRefresher::new(token.clone()))
        .build();

    let item: Item = processor
        .process(get("/v1/items/1"))
        .await
        .expect("get should succeed");

    assert_eq!(item, Item { id: 1 });
    assert_eq!(transport.dispatches(), 1);
    assert_eq!(token.refreshes(), 0);
    assert_eq!(transport.abandoned(), 0);
    let metrics = processor.metrics_snapshot();
    assert_eq!(metrics.calls_succeeded, 1);
    assert_eq!(metrics.dispatches, 1);
    assert_eq!(metrics.refresh_attempts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_token_is_refreshed_and_request_replayed() {
    init_tracing();
    let transport = ScriptedTransport::sequence(vec![
        (401, r#"{"code":"auth_expired"}"#),
        (200, r#"{"id":7}"#),
    ]);
    let token = TestToken::new();
    let processor = RequestProcessor::builder(transport.clone())
        .token_refresher(SharedTokenRefresher::new(token.clone()))
        .error_classifier(auth_classifier)
        .build();

    let request = Request::new(Method::POST, "https://api.example.com/v1/items")
        .expect("valid uri")
        .with_body(RequestBody::json(&json!({ "name": "demo" })).expect("json body"));
    let item: Item = processor
        .process(request)
        .await
        .expect("retried post should succeed");

    assert_eq!(item, Item { id: 7 });
    assert_eq!(transport.dispatches(), 2);
    assert_eq!(token.refreshes(), 1);
    let bodies = transport.bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0], bodies[1]);
    assert_eq!(bodies[0], Bytes::from_static(br#"{"name":"demo"}"#));

    let metrics = processor.metrics_snapshot();
    assert_eq!(metrics.refresh_attempts, 1);
    assert_eq!(metrics.refresh_failures, 0);
    assert_eq!(metrics.calls_succeeded, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_refresh_replaces_the_original_error() {
    init_tracing();
    let transport = ScriptedTransport::sequence(vec![(401, r#"{"code":"auth_expired"}"#)]);
    let token = TestToken {
        fail: true,
        ..TestToken::new()
    };
    let processor = RequestProcessor::builder(transport.clone())
        .token_refresher(SharedTokenRefresher::new(token.clone()))
        .error_classifier(auth_classifier)
        .build();

    let error = processor
        .process_completable(get("/v1/me"))
        .await
        .expect_err("refresh failure should surface");

    assert_eq!(error.code(), ErrorCode::Refresh);
    assert!(error.to_string().contains("refresh token revoked"));
    assert_eq!(transport.dispatches(), 1);
    assert_eq!(processor.metrics_snapshot().refresh_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unrefreshable_status_keeps_status_line() {
    let transport = ScriptedTransport::sequence(vec![(500, "upstream down")]);
    let processor = RequestProcessor::new(transport.clone());

    let error = processor
        .process::<Item>(get("/v1/items/1?secret=abc"))
        .await
        .expect_err("500 should fail");

    match error {
        Error::HttpStatus {
            status,
            status_line,
            body,
            uri,
            ..
        } => {
            assert_eq!(status, 500);
            assert_eq!(status_line, "500 Internal Server Error");
            assert_eq!(body, "upstream down");
            assert_eq!(uri, "https://api.example.com/v1/items/1");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.dispatches(), 1);
    assert_eq!(
        processor
            .metrics_snapshot()
            .error_counts
            .get("http_status:500"),
        Some(&1)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn decode_failure_is_not_retried() {
    let transport = ScriptedTransport::sequence(vec![(200, "not json")]);
    let token = TestToken::new();
    let processor = RequestProcessor::builder(transport.clone())
        .token_refresher(SharedTokenRefresher::new(token.clone()))
        .build();

    let error = processor
        .process::<Item>(get("/v1/items/1"))
        .await
        .expect_err("invalid json should fail");

    assert_eq!(error.code(), ErrorCode::Deserialize);
    assert_eq!(transport.dispatches(), 1);
    assert_eq!(token.refreshes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transport_failure_is_reported_with_kind() {
    let transport = ScriptedTransport::new(|_| Step::Fail);
    let processor = RequestProcessor::new(transport.clone());

    let error = processor
        .process_completable(get("/v1/ping"))
        .await
        .expect_err("transport failure");

    match error {
        Error::Transport { kind, method, .. } => {
            assert_eq!(kind, TransportErrorKind::Connect);
            assert_eq!(method, Method::GET);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_response_body_is_rejected() {
    let transport =
        ScriptedTransport::sequence(vec![(200, r#"{"id":1,"padding":"xxxxxxxxxxxx"}"#)]);
    let processor = RequestProcessor::builder(transport)
        .config(ProcessorConfig::default().with_max_response_body_bytes(16))
        .build();

    let error = processor
        .process::<Item>(get("/v1/items/1"))
        .await
        .expect_err("body exceeds limit");
    assert_eq!(error.code(), ErrorCode::ResponseBodyTooLarge);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_share_one_refresh() {
    init_tracing();
    let token = TestToken {
        delay: Duration::from_millis(100),
        ..TestToken::new()
    };
    let generation = Arc::clone(&token.generation);
    let transport = ScriptedTransport::new(move |_| {
        if generation.load(Ordering::SeqCst) == 0 {
            reply(401, r#"{"code":"auth_expired"}"#)
        } else {
            reply(200, r#"{"id":3}"#)
        }
    });
    let processor = RequestProcessor::builder(transport.clone())
        .token_refresher(SharedTokenRefresher::new(token.clone()))
        .error_classifier(auth_classifier)
        .build();

    let calls: Vec<_> = (0..5)
        .map(|_| processor.process::<Item>(get("/v1/items/3")))
        .collect();
    for call in calls {
        assert_eq!(call.await.expect("call should succeed"), Item { id: 3 });
    }

    assert_eq!(token.refreshes(), 1);
    assert!(transport.dispatches() >= 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refresh_retries_are_bounded() {
    init_tracing();
    let transport = ScriptedTransport::sequence(vec![(401, "{}")]);
    let token = TestToken::new();
    let processor = RequestProcessor::builder(transport.clone())
        .token_refresher(SharedTokenRefresher::new(token.clone()))
        .config(ProcessorConfig::default().with_max_refresh_retries(2))
        .build();

    let error = processor
        .process_completable(get("/v1/me"))
        .await
        .expect_err("token never accepted");

    match error {
        Error::RefreshRetriesExhausted { refreshes, last } => {
            assert_eq!(refreshes, 2);
            assert_eq!(last.status(), Some(StatusCode::UNAUTHORIZED));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.dispatches(), 3);
    assert_eq!(token.refreshes(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_call_drops_in_flight_dispatch() {
    init_tracing();
    let transport = ScriptedTransport::new(|_| Step::Hang);
    let processor = RequestProcessor::new(transport.clone());

    let call = processor.process::<Item>(get("/v1/slow"));
    let cancel = call.cancel_handle();
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    cancel.cancel();

    let error = call.await.expect_err("cancelled call has no value");
    assert!(error.is_cancelled());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while transport.abandoned() == 0
        || processor.metrics_snapshot().calls_cancelled == 0
    {
        assert!(
            tokio::time::Instant::now() < deadline,
            "dispatch should be dropped"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(transport.abandoned(), 1);
    let metrics = processor.metrics_snapshot();
    assert_eq!(metrics.calls_cancelled, 1);
    assert_eq!(metrics.calls_succeeded, 0);
    assert_eq!(metrics.calls_failed, 0);
    assert_eq!(metrics.in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_progress_then_download_progress_then_complete() {
    let download = vec![b'z'; 300];
    let transport = ScriptedTransport::new(move |_| Step::Reply {
        status: 200,
        body: download.clone(),
        chunk_size: 100,
    });
    let processor = RequestProcessor::new(transport.clone());

    let body = RequestBody::stream(Some(1000), || -> BodyStream {
        let chunks: Vec<Result<Bytes, BoxError>> =
            (0..10).map(|_| Ok(Bytes::from(vec![1_u8; 100]))).collect();
        Box::pin(stream::iter(chunks))
    });
    let request = Request::new(Method::PUT, "https://api.example.com/v1/files/a")
        .expect("valid uri")
        .with_body(body);

    let events: Vec<Progress> = processor
        .process_with_progress(request)
        .map(|item| item.expect("progress call should succeed"))
        .collect()
        .await;

    let uploads: Vec<Transfer> = events
        .iter()
        .filter_map(|event| match event {
            Progress::Uploading(transfer) => Some(*transfer),
            _ => None,
        })
        .collect();
    let downloads: Vec<Transfer> = events
        .iter()
        .filter_map(|event| match event {
            Progress::Downloading(transfer) => Some(*transfer),
            _ => None,
        })
        .collect();

    assert_eq!(uploads.len(), 10);
    assert!(
        uploads
            .windows(2)
            .all(|pair| pair[0].bytes_completed < pair[1].bytes_completed)
    );
    assert_eq!(
        uploads
            .iter()
            .filter(|transfer| transfer.bytes_completed == 1000)
            .count(),
        1
    );
    assert_eq!(uploads.last(), Some(&Transfer::new(1000, Some(1000))));
    assert_eq!(
        downloads,
        vec![
            Transfer::new(100, Some(300)),
            Transfer::new(200, Some(300)),
            Transfer::new(300, Some(300)),
        ]
    );

    let last_upload = events
        .iter()
        .rposition(|event| matches!(event, Progress::Uploading(_)))
        .expect("upload events");
    let first_download = events
        .iter()
        .position(|event| matches!(event, Progress::Downloading(_)))
        .expect("download events");
    assert!(last_upload < first_download);
    assert_eq!(events.last(), Some(&Progress::Complete));
    assert_eq!(
        events
            .iter()
            .filter(|event| **event == Progress::Complete)
            .count(),
        1
    );
    assert_eq!(transport.bodies()[0].len(), 1000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_with_result_ends_with_decoded_value() {
    let transport = ScriptedTransport::sequence(vec![(200, r#"{"id":42}"#)]);
    let processor = RequestProcessor::new(transport);

    let events: Vec<ProgressWithResult<Item>> = processor
        .process_with_progress_result::<Item>(get("/v1/items/42"))
        .map(|item| item.expect("call should succeed"))
        .collect()
        .await;

    assert!(matches!(
        events.first(),
        Some(ProgressWithResult::Downloading(_))
    ));
    let last = events.into_iter().last().expect("terminal event");
    assert!(last.is_complete());
    assert_eq!(last.into_result(), Some(Item { id: 42 }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_failure_ends_stream_without_complete() {
    let transport = ScriptedTransport::sequence(vec![(404, "missing")]);
    let processor = RequestProcessor::new(transport);

    let items: Vec<Result<Progress, Error>> = processor
        .process_with_progress(get("/v1/files/missing"))
        .collect()
        .await;

    let (last, rest) = items.split_last().expect("terminal item");
    match last {
        Err(error) => assert_eq!(error.status(), Some(StatusCode::NOT_FOUND)),
        Ok(event) => panic!("expected failure, got {event:?}"),
    }
    assert!(
        rest.iter()
            .all(|item| !matches!(item, Ok(Progress::Complete) | Err(_)))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_progress_stream_just_ends() {
    let transport = ScriptedTransport::new(|_| Step::Hang);
    let processor = RequestProcessor::new(transport.clone());

    let mut events = processor.process_with_progress(get("/v1/files/slow"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    events.cancel();
    events.cancel();

    assert!(events.next().await.is_none());
    assert!(events.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_call_is_refreshed_and_upload_restarts() {
    init_tracing();
    let transport = ScriptedTransport::sequence(vec![
        (401, r#"{"code":"auth_expired"}"#),
        (200, r#"{"id":5}"#),
    ]);
    let token = TestToken::new();
    let processor = RequestProcessor::builder(transport.clone())
        .token_refresher(SharedTokenRefresher::new(token.clone()))
        .error_classifier(auth_classifier)
        .build();

    let body = RequestBody::stream(Some(200), || -> BodyStream {
        let chunks: Vec<Result<Bytes, BoxError>> =
            (0..2).map(|_| Ok(Bytes::from(vec![2_u8; 100]))).collect();
        Box::pin(stream::iter(chunks))
    });
    let request = Request::new(Method::PUT, "https://api.example.com/v1/files/b")
        .expect("valid uri")
        .with_body(body);

    let events: Vec<ProgressWithResult<Item>> = processor
        .process_with_progress_result::<Item>(request)
        .map(|item| item.expect("retried progress call should succeed"))
        .collect()
        .await;

    let uploaded: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            ProgressWithResult::Uploading(transfer) => Some(transfer.bytes_completed),
            _ => None,
        })
        .collect();
    assert_eq!(uploaded, vec![100, 200, 100, 200]);
    assert_eq!(events.iter().filter(|event| event.is_complete()).count(), 1);
    let last = events.into_iter().last().expect("terminal event");
    assert_eq!(last.into_result(), Some(Item { id: 5 }));
    assert_eq!(transport.dispatches(), 2);
    assert_eq!(token.refreshes(), 1);
    assert_eq!(transport.bodies()[1].len(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_length_upload_reports_no_total() {
    let transport = ScriptedTransport::sequence(vec![(200, r#"{"stored":true}"#)]);
    let processor = RequestProcessor::new(transport.clone());

    let body = RequestBody::stream(None, || -> BodyStream {
        let chunks: Vec<Result<Bytes, BoxError>> =
            (0..3).map(|_| Ok(Bytes::from(vec![3_u8; 50]))).collect();
        Box::pin(stream::iter(chunks))
    });
    let request = Request::new(Method::POST, "https://api.example.com/v1/logs")
        .expect("valid uri")
        .with_body(body);

    let events: Vec<Progress> = processor
        .process_with_progress(request)
        .map(|item| item.expect("upload should succeed"))
        .collect()
        .await;

    let uploads: Vec<Transfer> = events
        .iter()
        .filter_map(|event| match event {
            Progress::Uploading(transfer) => Some(*transfer),
            _ => None,
        })
        .collect();
    assert_eq!(uploads.len(), 3);
    assert!(
        uploads
            .iter()
            .all(|transfer| transfer.bytes_total.is_none() && transfer.fraction().is_none())
    );
    assert_eq!(uploads.last().map(|transfer| transfer.bytes_completed), Some(150));
    assert_eq!(events.last(), Some(&Progress::Complete));
}

/// Cancels the call from inside the exchange, then answers at once, so the
/// pipeline completes after cancellation.
#[derive(Default)]
struct CancellingTransport {
    handle: Mutex<Option<CancelHandle>>,
}

impl Transport for CancellingTransport {
    fn send(&self, request: TransportRequest) -> TransportFuture {
        let handle = self.handle.lock().expect("lock handle").take();
        Box::pin(async move {
            drop(request);
            if let Some(handle) = handle {
                handle.cancel();
            }
            let chunks: Vec<Result<Bytes, BoxError>> = vec![Ok(Bytes::from_static(br#"{"id":3}"#))];
            let stream: BodyStream = Box::pin(stream::iter(chunks));
            Ok(http::Response::new(stream_req_body(stream)))
        })
    }
}

#[tokio::test]
async fn completion_after_cancel_is_counted_as_cancelled() {
    let transport = Arc::new(CancellingTransport::default());
    let processor = RequestProcessor::new(transport.clone());

    let call = processor.process::<Item>(get("/v1/items/3"));
    *transport.handle.lock().expect("lock handle") = Some(call.cancel_handle());

    let error = call.await.expect_err("cancelled call has no value");
    assert!(error.is_cancelled());

    let metrics = processor.metrics_snapshot();
    assert_eq!(metrics.dispatches, 1);
    assert_eq!(metrics.calls_cancelled, 1);
    assert_eq!(metrics.calls_succeeded, 0);
    assert_eq!(metrics.calls_failed, 0);
}
