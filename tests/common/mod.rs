//! Test origin server with range support and failure injection.

#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Response, StatusCode, header};
use axum::routing::get;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Deterministic pseudo-random payload of `len` bytes.
pub fn make_payload(len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    let mut state = 0x2545F491_u64;
    while data.len() < len {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        data.extend_from_slice(&state.to_le_bytes());
    }
    data.truncate(len);
    data
}

/// SHA-256 hex digest of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Behavior knobs for the origin.
#[derive(Default)]
pub struct OriginConfig {
    /// Serve 200 with the whole body even for ranged requests
    pub ignore_ranges: bool,
    /// Fail every request with this status (mirror-failure injection)
    pub fail_status: Option<u16>,
    /// Sleep this long per 64 KiB chunk (keeps transfers observable)
    pub throttle: Option<Duration>,
    /// The first ranged request sends a few bytes and then hangs forever
    pub stall_first_range: bool,
}

struct OriginState {
    data: Vec<u8>,
    config: OriginConfig,
    range_requests: AtomicUsize,
    total_requests: AtomicUsize,
    stall_armed: AtomicUsize,
}

/// A local HTTP origin serving one payload.
pub struct Origin {
    state: Arc<OriginState>,
    addr: SocketAddr,
}

impl Origin {
    /// Spawn an origin serving `data` with the given behavior.
    pub async fn spawn(data: Vec<u8>, config: OriginConfig) -> Self {
        let stall = config.stall_first_range;
        let state = Arc::new(OriginState {
            data,
            config,
            range_requests: AtomicUsize::new(0),
            total_requests: AtomicUsize::new(0),
            stall_armed: AtomicUsize::new(usize::from(stall)),
        });

        let app = Router::new()
            .route("/{*path}", get(serve))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test origin");
        let addr = listener.local_addr().expect("origin addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self { state, addr }
    }

    /// URL for a path on this origin.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    /// Number of ranged requests served so far.
    pub fn range_requests(&self) -> usize {
        self.state.range_requests.load(Ordering::SeqCst)
    }

    /// Number of requests served so far (any kind).
    pub fn total_requests(&self) -> usize {
        self.state.total_requests.load(Ordering::SeqCst)
    }

    /// The payload this origin serves.
    pub fn data(&self) -> &[u8] {
        &self.state.data
    }
}

async fn serve(State(state): State<Arc<OriginState>>, headers: HeaderMap) -> Response<Body> {
    state.total_requests.fetch_add(1, Ordering::SeqCst);

    if let Some(status) = state.config.fail_status {
        return Response::builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
            .body(Body::empty())
            .unwrap();
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    match range {
        Some((start, end)) if !state.config.ignore_ranges => {
            state.range_requests.fetch_add(1, Ordering::SeqCst);
            let total = state.data.len() as u64;
            let end = end.min(total.saturating_sub(1));
            if start >= total || start > end {
                return Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{total}"))
                    .body(Body::empty())
                    .unwrap();
            }

            let slice = state.data[start as usize..=end as usize].to_vec();
            let len = slice.len();

            // Stall injection: leak a few bytes, then hang forever
            if state
                .stall_armed
                .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let leak = slice[..1024.min(len)].to_vec();
                let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(leak)])
                    .chain(futures::stream::pending());
                return Response::builder()
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(header::ACCEPT_RANGES, "bytes")
                    .header(header::CONTENT_LENGTH, len)
                    .header(
                        header::CONTENT_RANGE,
                        format!("bytes {start}-{end}/{total}"),
                    )
                    .body(Body::from_stream(stream))
                    .unwrap();
            }

            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, len)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{total}"),
                )
                .body(throttled_body(slice, state.config.throttle))
                .unwrap()
        }
        _ => {
            let body = state.data.clone();
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, body.len());
            if !state.config.ignore_ranges {
                builder = builder.header(header::ACCEPT_RANGES, "bytes");
            }
            builder
                .body(throttled_body(body, state.config.throttle))
                .unwrap()
        }
    }
}

fn throttled_body(data: Vec<u8>, throttle: Option<Duration>) -> Body {
    match throttle {
        None => Body::from(data),
        Some(delay) => {
            let chunks: Vec<Vec<u8>> = data.chunks(64 * 1024).map(|c| c.to_vec()).collect();
            let stream = futures::stream::iter(chunks).then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, std::io::Error>(chunk)
            });
            Body::from_stream(stream)
        }
    }
}

/// Parse `bytes=A-B` (both bounds present, as the engine always sends).
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        u64::MAX
    } else {
        end.parse().ok()?
    };
    Some((start, end))
}

/// Wait until `events` yields an event matching `pred`, or panic after `timeout`.
pub async fn wait_for_event<F>(
    events: &mut tokio::sync::broadcast::Receiver<http_dl::Event>,
    timeout: Duration,
    mut pred: F,
) -> http_dl::Event
where
    F: FnMut(&http_dl::Event) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            panic!("timed out waiting for event");
        }
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) => continue,
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(e)) => panic!("event channel closed: {e}"),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}
