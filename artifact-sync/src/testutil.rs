//! In-process artifact server for tests.
//!
//! Serves `/manifests/{revision}.json` and `/artifacts/{digest}` from memory,
//! with per-digest failure injection, request counting and in-flight tracking.
//! Also captures tracing output for assertions on logged warnings.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::subscriber::DefaultGuard;

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[derive(Default)]
struct ServerState {
    manifests: HashMap<String, String>,
    blobs: HashMap<String, Vec<u8>>,
    fail_manifests: bool,
    delay: Duration,
    failures: Mutex<HashMap<String, usize>>,
    drops: Mutex<HashMap<String, usize>>,
    hits: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[derive(Default)]
pub struct TestServerBuilder {
    state: ServerState,
}

impl TestServerBuilder {
    pub fn manifest(mut self, revision: &str, body: impl Into<String>) -> Self {
        self.state.manifests.insert(revision.to_string(), body.into());
        self
    }

    /// Serve `contents` under its own digest.
    pub fn blob(self, contents: &[u8]) -> Self {
        let digest = sha256_hex(contents);
        self.blob_at(&digest, contents)
    }

    /// Serve `contents` under an arbitrary digest.
    pub fn blob_at(mut self, digest: &str, contents: &[u8]) -> Self {
        self.state.blobs.insert(digest.to_string(), contents.to_vec());
        self
    }

    /// Answer the first `count` requests for `digest` with 503.
    pub fn fail_first(self, digest: &str, count: usize) -> Self {
        self.state
            .failures
            .lock()
            .unwrap()
            .insert(digest.to_string(), count);
        self
    }

    /// Abort the connection mid-body for the first `count` requests for `digest`.
    pub fn drop_first(self, digest: &str, count: usize) -> Self {
        self.state
            .drops
            .lock()
            .unwrap()
            .insert(digest.to_string(), count);
        self
    }

    /// Hold every blob request for `delay` before answering.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.state.delay = delay;
        self
    }

    /// Answer every manifest request with 500.
    pub fn fail_manifests(mut self) -> Self {
        self.state.fail_manifests = true;
        self
    }

    pub async fn start(self) -> TestServer {
        let state = Arc::new(self.state);
        let app = Router::new()
            .route("/manifests/{file}", get(manifest))
            .route("/artifacts/{digest}", get(artifact))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            base_url: format!("http://{}", addr),
            state,
        }
    }
}

pub struct TestServer {
    pub base_url: String,
    state: Arc<ServerState>,
}

impl TestServer {
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::default()
    }

    /// Number of blob requests received for `digest`.
    pub fn hits(&self, digest: &str) -> usize {
        self.state.hits.lock().unwrap().get(digest).copied().unwrap_or(0)
    }

    /// Total blob requests received.
    pub fn total_hits(&self) -> usize {
        self.state.hits.lock().unwrap().values().sum()
    }

    /// Highest number of blob requests that were being served at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

async fn manifest(State(state): State<Arc<ServerState>>, Path(file): Path<String>) -> Response {
    if state.fail_manifests {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let revision = file.strip_suffix(".json").unwrap_or(&file);
    match state.manifests.get(revision) {
        Some(body) => ([(header::CONTENT_TYPE, "application/json")], body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn artifact(State(state): State<Arc<ServerState>>, Path(digest): Path<String>) -> Response {
    let current = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(current, Ordering::SeqCst);
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }

    let response = blob_response(&state, &digest);
    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    response
}

fn blob_response(state: &ServerState, digest: &str) -> Response {
    *state.hits.lock().unwrap().entry(digest.to_string()).or_default() += 1;

    if take_one(&state.failures, digest) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let Some(contents) = state.blobs.get(digest) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if take_one(&state.drops, digest) {
        // Half the body, then an error: the server resets the connection
        let half = Bytes::copy_from_slice(&contents[..contents.len() / 2]);
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(half),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "dropped")),
        ];
        return Body::from_stream(futures_util::stream::iter(chunks)).into_response();
    }

    contents.clone().into_response()
}

/// Decrement the counter for `digest` if it is still positive.
fn take_one(counters: &Mutex<HashMap<String, usize>>, digest: &str) -> bool {
    match counters.lock().unwrap().get_mut(digest) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

/// Address with nothing listening on it.
pub async fn refused_base_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// Tracing output captured for the current thread.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Number of captured lines containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.contents().lines().filter(|l| l.contains(needle)).count()
    }
}

/// Route tracing events on this thread into a buffer until the guard drops.
///
/// Only events emitted on the calling thread are seen, so use it with the
/// default current-thread `#[tokio::test]` runtime.
pub fn capture_logs() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}
