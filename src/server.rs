//! Server accept loop, background tasks, and graceful shutdown.
//!
//! Contains the runtime infrastructure that sits between the TCP listener
//! and the per-request pipeline. Kept apart from `main()` so the server can
//! be driven from tests without signal handling or `std::process::exit`.

use std::sync::Arc;
use std::time::Duration;

use hyper::Response;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::GateError;
use crate::counter::WindowCounter;
use crate::proxy::{BoxBody, HttpClient, handle_request};
use crate::state::AppState;
use crate::violations::ViolationTracker;

/// Accepts connections on `listener` and dispatches them through the
/// request pipeline using the given `client` and shared `state`.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. In-flight requests on already-spawned tasks continue
/// to completion independently.
pub async fn serve(
    listener: TcpListener,
    client: HttpClient,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()>,
) {
    let concurrency_limit = state.max_concurrent_requests;
    let semaphore = Arc::new(Semaphore::new(concurrency_limit));

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let client = client.clone();
                let state = Arc::clone(&state);
                let semaphore = Arc::clone(&semaphore);

                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let client = client.clone();
                        let state = Arc::clone(&state);
                        let semaphore = Arc::clone(&semaphore);
                        async move {
                            let Ok(_permit) = semaphore.try_acquire() else {
                                warn!(
                                    limit = concurrency_limit,
                                    "concurrency limit reached, rejecting request"
                                );
                                let err = GateError::ServiceUnavailable {
                                    limit: concurrency_limit,
                                };
                                return Ok::<Response<BoxBody>, std::convert::Infallible>(
                                    err.into_response(),
                                );
                            };

                            let resp = handle_request(req, client, state, client_addr)
                                .await
                                .unwrap_or_else(GateError::into_response);
                            Ok::<Response<BoxBody>, std::convert::Infallible>(resp)
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Spawns a background task that periodically drops stale violation
/// records, expired blocks and finished counter windows.
///
/// Expiry is already applied lazily on read, so the sweeper only bounds
/// memory; it never changes what a lookup returns.
pub fn spawn_sweeper(
    tracker: ViolationTracker,
    counter: Arc<dyn WindowCounter>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let report = tracker.sweep();
            let windows = counter.retain_recent();
            if report.violations + report.blocks + windows > 0 {
                info!(
                    violations = report.violations,
                    blocks = report.blocks,
                    windows,
                    "sweep completed"
                );
            } else {
                debug!("sweep found nothing to drop");
            }
        }
    })
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
///
/// If a handler cannot be registered the error is logged and only the
/// remaining signal source is awaited.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(%e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        let sigterm = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(%e, "failed to register SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            () = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
            () = sigterm => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}
