//! Test doubles for the collaborators of the synchronizer.

use crate::errors::{ListenerError, QueueError, RecorderError};
use crate::governor::Governor;
use crate::listener::ImpressionListener;
use crate::protocol::ImpressionCountsDto;
use crate::queue::ImpressionQueue;
use crate::recorder::{ImpressionCountRecorder, ImpressionRecorder};
use crate::telemetry::{ImpressionsStatKind, ResourceKind, TelemetryRecorder};
use crate::types::{
    FeatureImpressions, Identity, Impression, ImpressionsForDestination, QueuedImpression,
};
use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

pub fn identity_a() -> Identity {
    Identity::new("1.1.1.1", "machine1", "go-1.1.1")
}

pub fn identity_b() -> Identity {
    Identity::new("2.2.2.2", "machine2", "php-2.2.2")
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

pub fn impression(feature: &str, key: &str) -> Impression {
    Impression {
        feature: feature.to_string(),
        key: key.to_string(),
        bucketing_key: Some("someBucketingKey".to_string()),
        treatment: "someTreatment".to_string(),
        label: "someLabel".to_string(),
        change_number: 123456789,
        time: now_millis(),
        previous_time: None,
    }
}

pub fn queued(feature: &str, key: &str, identity: Identity) -> QueuedImpression {
    QueuedImpression {
        impression: impression(feature, key),
        identity,
    }
}

/// Builds a destination with `n` distinct keys for each `(feature, n)`.
pub fn destination(identity: Identity, features: &[(&str, usize)]) -> ImpressionsForDestination {
    ImpressionsForDestination {
        identity,
        features: features
            .iter()
            .map(|(feature, n)| FeatureImpressions {
                feature: feature.to_string(),
                impressions: (0..*n)
                    .map(|i| impression(feature, &format!("key{i}")))
                    .collect(),
            })
            .collect(),
    }
}

/// Hands out pre-loaded batches, one per pop.
pub struct MockQueue {
    batches: Mutex<VecDeque<Result<Vec<QueuedImpression>, String>>>,
    requested: Mutex<Vec<usize>>,
}

impl MockQueue {
    pub fn new(batches: Vec<Vec<QueuedImpression>>) -> Self {
        MockQueue {
            batches: Mutex::new(batches.into_iter().map(Ok).collect()),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        MockQueue {
            batches: Mutex::new(VecDeque::from([Err(message.to_string())])),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn requested(&self) -> Vec<usize> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl ImpressionQueue for MockQueue {
    async fn pop_n_with_metadata(&self, n: usize) -> Result<Vec<QueuedImpression>, QueueError> {
        self.requested.lock().push(n);
        match self.batches.lock().pop_front() {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(message)) => Err(QueueError::Unavailable(message)),
            None => Ok(Vec::new()),
        }
    }

    fn count(&self) -> usize {
        self.batches
            .lock()
            .iter()
            .map(|b| b.as_ref().map(Vec::len).unwrap_or(0))
            .sum()
    }
}

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub destination: ImpressionsForDestination,
    pub headers: HashMap<String, String>,
}

#[derive(Default)]
pub struct MockRecorder {
    calls: Mutex<Vec<RecordedCall>>,
    failing_machines: HashSet<String>,
    delay: Option<Duration>,
}

impl MockRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every call for the given machine names.
    pub fn failing_for(machines: &[&str]) -> Self {
        MockRecorder {
            failing_machines: machines.iter().map(|m| m.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        MockRecorder {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_for(&self, identity: &Identity) -> Option<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .find(|c| &c.destination.identity == identity)
            .cloned()
    }
}

#[async_trait]
impl ImpressionRecorder for MockRecorder {
    async fn record(
        &self,
        impressions: &ImpressionsForDestination,
        extra_headers: &HashMap<String, String>,
    ) -> Result<(), RecorderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().push(RecordedCall {
            destination: impressions.clone(),
            headers: extra_headers.clone(),
        });
        if self
            .failing_machines
            .contains(&impressions.identity.machine_name)
        {
            return Err(RecorderError::Status {
                status: 500,
                body: "internal error".into(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockListener {
    calls: Mutex<Vec<ImpressionsForDestination>>,
    fail: bool,
}

impl MockListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        MockListener {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ImpressionsForDestination> {
        self.calls.lock().clone()
    }

    pub fn call_for(&self, identity: &Identity) -> Option<ImpressionsForDestination> {
        self.calls
            .lock()
            .iter()
            .find(|c| &c.identity == identity)
            .cloned()
    }
}

#[async_trait]
impl ImpressionListener for MockListener {
    async fn submit(&self, impressions: &ImpressionsForDestination) -> Result<(), ListenerError> {
        self.calls.lock().push(impressions.clone());
        if self.fail {
            return Err(ListenerError::Status { status: 503 });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTelemetry {
    latencies: Mutex<Vec<ResourceKind>>,
    successes: Mutex<Vec<ResourceKind>>,
    stats: Mutex<Vec<(ImpressionsStatKind, u64)>>,
}

impl MockTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latencies(&self) -> Vec<ResourceKind> {
        self.latencies.lock().clone()
    }

    pub fn successes(&self) -> Vec<ResourceKind> {
        self.successes.lock().clone()
    }

    pub fn stats(&self) -> Vec<(ImpressionsStatKind, u64)> {
        self.stats.lock().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.latencies.lock().len() + self.successes.lock().len() + self.stats.lock().len()
    }
}

impl TelemetryRecorder for MockTelemetry {
    fn record_sync_latency(&self, resource: ResourceKind, _latency: Duration) {
        self.latencies.lock().push(resource);
    }

    fn record_successful_sync(&self, resource: ResourceKind, _when: SystemTime) {
        self.successes.lock().push(resource);
    }

    fn record_impressions_stats(&self, kind: ImpressionsStatKind, count: u64) {
        self.stats.lock().push((kind, count));
    }
}

/// Governor that always answers the same way and counts how it was used.
pub struct MockGovernor {
    allow: bool,
    acquires: AtomicUsize,
    releases: AtomicUsize,
    flushes: Mutex<Vec<(usize, usize)>>,
    passes: Mutex<Vec<usize>>,
}

impl MockGovernor {
    pub fn allowing() -> Self {
        Self::new(true)
    }

    pub fn denying() -> Self {
        Self::new(false)
    }

    fn new(allow: bool) -> Self {
        MockGovernor {
            allow,
            acquires: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            flushes: Mutex::new(Vec::new()),
            passes: Mutex::new(Vec::new()),
        }
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// `(items, bytes)` for each flush reported.
    pub fn flushes(&self) -> Vec<(usize, usize)> {
        self.flushes.lock().clone()
    }

    /// Popped count for each governed pass.
    pub fn passes(&self) -> Vec<usize> {
        self.passes.lock().clone()
    }
}

impl Governor for MockGovernor {
    fn acquire(&self) -> bool {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.allow
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn busy(&self) -> bool {
        !self.allow
    }

    fn store_data_flushed(&self, _when: SystemTime, items: usize, bytes: usize) {
        self.flushes.lock().push((items, bytes));
    }

    fn record_pass(&self, _when: SystemTime, popped: usize) {
        self.passes.lock().push(popped);
    }
}

#[derive(Default)]
pub struct MockCountRecorder {
    calls: Mutex<Vec<ImpressionCountsDto>>,
    fail: bool,
}

impl MockCountRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        MockCountRecorder {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ImpressionCountsDto> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ImpressionCountRecorder for MockCountRecorder {
    async fn record_counts(&self, counts: &ImpressionCountsDto) -> Result<(), RecorderError> {
        self.calls.lock().push(counts.clone());
        if self.fail {
            return Err(RecorderError::Status {
                status: 500,
                body: String::new(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct CapturedRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// HTTP server on a random local port that records every request and
/// answers with a fixed status.
pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(status: StatusCode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to address");
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let captured = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let io = TokioIo::new(stream);
                let captured = captured.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let captured = captured.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes())
                                .unwrap_or_else(|_| Bytes::new());
                            captured.lock().push(CapturedRequest {
                                path: parts.uri.path().to_string(),
                                headers: parts.headers,
                                body,
                            });

                            let mut response = Response::new(Full::new(Bytes::new()));
                            *response.status_mut() = status;
                            Ok::<_, Infallible>(response)
                        }
                    });

                    if let Err(err) =
                        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                            .serve_connection(io, service)
                            .await
                    {
                        eprintln!("Error serving connection: {:?}", err);
                    }
                });
            }
        });

        TestServer {
            addr,
            requests,
            handle,
        }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
