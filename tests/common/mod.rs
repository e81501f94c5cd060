//! Shared test infrastructure for integration tests.
//!
//! Provides state builders, request constructors, a throwaway server bound
//! to an OS-assigned port, and body collection helpers used across all
//! integration test modules.

#![allow(dead_code)]

use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{Method, Request, Response};
use ipsaur::server::serve;
use ipsaur::{AppState, BoxBody, Config, RuntimeConfig, handle_request, respond};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

/// Builds a `RuntimeConfig` with the given rate-limit threshold and no
/// geolocation databases.
pub fn test_config(threshold_ms: i64) -> RuntimeConfig {
    Config {
        rate_limit_threshold_ms: Some(threshold_ms),
        links: vec![ipsaur::Link {
            name: "Wiki".into(),
            url: "https://example.org/wiki".into(),
            icon: None,
        }],
        ..Default::default()
    }
    .into_runtime()
    .expect("test config must be valid")
}

/// State with rate limiting disabled and nothing loaded from disk.
pub fn test_state() -> AppState {
    AppState::new(test_config(0))
}

/// State with the given rate-limit threshold.
pub fn limited_state(threshold_ms: i64) -> AppState {
    AppState::new(test_config(threshold_ms))
}

/// A bodiless request.
pub fn request(method: Method, uri: &str, headers: &[(&str, &str)]) -> Request<Empty<Bytes>> {
    headers
        .iter()
        .fold(Request::builder().method(method).uri(uri), |b, (k, v)| {
            b.header(*k, *v)
        })
        .body(Empty::new())
        .unwrap()
}

pub fn get(uri: &str) -> Request<Empty<Bytes>> {
    request(Method::GET, uri, &[])
}

/// Sends a request through [`handle_request`], panicking on handler errors.
pub async fn call(state: &AppState, req: Request<Empty<Bytes>>) -> Response<BoxBody> {
    handle_request(req, state, test_addr())
        .await
        .expect("handler must succeed")
}

/// Sends a request through the outer [`respond`] wrapper.
pub async fn call_wrapped<B>(state: &AppState, req: Request<B>) -> Response<BoxBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    respond(req, state, test_addr()).await
}

pub fn post(uri: &str, body: impl Into<Bytes>) -> Request<Full<Bytes>> {
    let body = body.into();
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-length", body.len())
        .body(Full::new(body))
        .unwrap()
}

/// Collects a [`BoxBody`] into [`Bytes`], mapping any body error to a
/// descriptive panic so test assertions remain concise.
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

pub async fn body_string(resp: Response<BoxBody>) -> String {
    String::from_utf8(collect_body(resp.into_body()).await.to_vec()).unwrap()
}

/// Starts the real accept loop on an OS-assigned port. Returns the server
/// address and a handle to shut it down.
pub async fn start_server(state: AppState) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(serve(listener, state, async {
        let _ = rx.await;
    }));

    (addr, tx)
}

/// Sends a raw HTTP/1.1 request with `Connection: close` and returns the
/// full response text.
pub async fn raw_request(addr: SocketAddr, head: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect failed");
    let request = format!("{head}\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}
