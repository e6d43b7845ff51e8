//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backends, configuration and state builders,
//! request constructors, and body helpers used across all integration
//! test modules.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::DateTime;
use gatekeeper::config::{ControlConfig, RateLimitConfig, UserConfig};
use gatekeeper::{
    AppState, BoxBody, Config, HttpClient, ManualClock, Plan, RuntimeConfig, SharedClock,
    build_client, handle_request,
};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Operator token configured by [`test_config`].
pub const ADMIN_TOKEN: &str = "test-token";

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

pub fn test_client() -> HttpClient {
    build_client(Duration::from_secs(5))
}

/// A manual clock parked on a minute boundary (2023-11-14T22:14:00Z).
pub fn test_clock() -> ManualClock {
    ManualClock::new(DateTime::from_timestamp(1_700_000_040, 0).unwrap())
}

/// Collects a [`BoxBody`] into [`Bytes`].
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// Collects a response body and parses it as JSON.
pub async fn json_body(resp: Response<BoxBody>) -> serde_json::Value {
    let bytes = collect_body(resp.into_body()).await;
    serde_json::from_slice(&bytes).expect("response body must be JSON")
}

/// Builds a `Config` targeting the given local backend address with the
/// given base limit per minute.
pub fn test_config(addr: SocketAddr, base_limit: u64) -> Config {
    Config {
        upstream: Some(format!("http://{addr}")),
        rate_limit: RateLimitConfig {
            base_limit,
            ..Default::default()
        },
        control: ControlConfig {
            token: Some(ADMIN_TOKEN.into()),
            ..Default::default()
        },
        users: vec![
            UserConfig {
                id: 1,
                plan: Plan::Free,
                admin: false,
            },
            UserConfig {
                id: 2,
                plan: Plan::Premium,
                admin: false,
            },
            UserConfig {
                id: 3,
                plan: Plan::Free,
                admin: true,
            },
        ],
        ..Default::default()
    }
}

pub fn runtime(config: Config) -> RuntimeConfig {
    config.into_runtime().expect("test config must be valid")
}

/// Builds shared state from `config`, wired to `clock`.
pub fn test_state(config: Config, clock: &ManualClock) -> Arc<AppState> {
    let clock: SharedClock = Arc::new(clock.clone());
    Arc::new(AppState::with_clock(runtime(config), clock))
}

pub fn get(path: &str) -> Request<Empty<Bytes>> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Empty::new())
        .unwrap()
}

/// A request authenticated as `user_id` through the user id header.
pub fn get_as(path: &str, user_id: u64) -> Request<Empty<Bytes>> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .header("x-user-id", user_id.to_string())
        .body(Empty::new())
        .unwrap()
}

/// An operator request carrying the test token.
pub fn admin(method: Method, path: &str, body: Option<&str>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("authorization", format!("Bearer {ADMIN_TOKEN}"));
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    builder
        .body(Full::new(Bytes::from(body.unwrap_or_default().to_owned())))
        .unwrap()
}

/// Runs one request through the pipeline, rendering errors as responses
/// the way the server does.
pub async fn send<B>(req: Request<B>, state: &Arc<AppState>) -> Response<BoxBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    send_from(req, state, test_addr()).await
}

pub async fn send_from<B>(
    req: Request<B>,
    state: &Arc<AppState>,
    client_addr: SocketAddr,
) -> Response<BoxBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    handle_request(req, test_client(), Arc::clone(state), client_addr)
        .await
        .unwrap_or_else(|e| e.into_response())
}

/// Starts a local HTTP server that responds to every request with the given
/// status, content-type, and body. Returns the server address and a handle
/// to shut it down.
pub async fn start_backend(
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(move |_req: Request<Incoming>| {
                        async move {
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(status)
                                    .header("content-type", content_type)
                                    .body(Full::new(Bytes::from(body)))
                                    .expect("test response must build"),
                            )
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a local backend that echoes request headers as the response
/// body. Used to verify what the gateway forwards.
pub async fn start_echo_headers_backend() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let mut lines = Vec::new();
                        for (name, value) in req.headers() {
                            if let Ok(v) = value.to_str() {
                                lines.push(format!("{}: {}", name.as_str(), v));
                            }
                        }
                        lines.sort();
                        let body = lines.join("\n");
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "text/plain")
                                .body(Full::new(Bytes::from(body)))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a backend that sleeps for the given duration before responding.
pub async fn start_slow_backend(delay: Duration) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(move |_req: Request<Incoming>| async move {
                        tokio::time::sleep(delay).await;
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "text/plain")
                                .body(Full::new(Bytes::from("slow")))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}
