//! Core request handler: control routes, the throttle gate, and forwarding
//! of admitted requests to the protected upstream.
//!
//! Every inbound request is assigned a monotonically increasing request ID
//! and wrapped in a [`tracing::Span`] carrying structured fields for
//! observability.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::{Instrument, debug, info, warn};

use crate::identity::principal_from_headers;
use crate::state::AppState;
use crate::{GateError, Result, control, headers};

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
pub type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased body used for both request forwarding and response streaming.
///
/// Uses a trait-object error type so that both `Incoming` (which yields
/// `hyper::Error`) and locally constructed bodies (which are infallible)
/// can be erased into the same type without lossy conversions.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, StdError>;

/// The HTTP client type for upstream connections.
pub type HttpClient = Client<HttpConnector, BoxBody>;

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Wraps an in-memory chunk into a [`BoxBody`].
pub fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| -> StdError { match never {} })
        .boxed()
}

/// Constructs a new [`HttpClient`] with the given pool idle timeout.
pub fn build_client(pool_idle_timeout: Duration) -> HttpClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(pool_idle_timeout)
        .build(HttpConnector::new())
}

/// Processes a single inbound request.
///
/// 1. **Principal**: the authenticated caller, if the configured user id
///    header carries one, is attached to the request extensions.
/// 2. **Control routes**: paths under the control prefix are answered by
///    the gateway itself and never reach the gate or the upstream.
/// 3. **Gate**: the throttle gate admits or denies the request. Denials
///    become 403 (blocked) or 429 (throttled) responses.
/// 4. **Forwarding**: hop-by-hop headers are stripped, `X-Forwarded-*`
///    injected, `Host` and the URI rewritten to the upstream, and the body
///    streamed through under the request timeout.
/// 5. **Rate-limit headers**: admitted, counted responses carry
///    `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
pub async fn handle_request<B>(
    mut req: Request<B>,
    client: HttpClient,
    state: Arc<AppState>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<StdError>,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %req.method(),
        uri = %req.uri(),
        client = %client_addr,
    );

    async move {
        if let Some(principal) = principal_from_headers(req.headers(), &state.identity) {
            debug!(user_id = principal.user_id, "authenticated principal");
            req.extensions_mut().insert(principal);
        }

        if control::is_control_path(&state.control.prefix, req.uri().path()) {
            return control::handle(req, &state, client_addr).await;
        }

        let verdict = state.gate.check(&req, Some(client_addr)).await?;

        let upstream = &state.upstream;
        let authority = upstream
            .authority()
            .ok_or_else(|| GateError::InvalidUpstream("upstream has no authority".into()))?;

        let rewritten_uri = rewrite_uri(req.uri(), upstream)?;
        let (mut parts, body) = req.into_parts();

        headers::strip_hop_by_hop(&mut parts.headers);
        headers::inject_forwarding_headers(&mut parts.headers, client_addr);
        headers::rewrite_host(&mut parts.headers, authority);
        parts.uri = rewritten_uri;

        debug!(upstream_uri = %parts.uri, "forwarding request");

        let start = std::time::Instant::now();
        let proxy_req = Request::from_parts(parts, body.map_err(|e| e.into()).boxed());

        let mut upstream_resp =
            match timeout(state.request_timeout, client.request(proxy_req)).await {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => {
                    warn!(
                        error = %e,
                        latency_ms = start.elapsed().as_millis() as u64,
                        upstream = %upstream,
                        "upstream request failed"
                    );
                    return Err(GateError::Upstream(e));
                }
                Err(_elapsed) => {
                    warn!(
                        timeout = ?state.request_timeout,
                        upstream = %upstream,
                        "upstream request timed out"
                    );
                    return Err(GateError::Timeout(state.request_timeout));
                }
            };

        info!(
            status = upstream_resp.status().as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "upstream responded"
        );

        headers::strip_hop_by_hop(upstream_resp.headers_mut());
        if let Some(verdict) = verdict {
            headers::insert_rate_limit_headers(
                upstream_resp.headers_mut(),
                verdict.limit,
                verdict.remaining,
                verdict.reset_at,
            );
        }

        Ok(stream_response(upstream_resp))
    }
    .instrument(span)
    .await
}

/// Rewrites the original request URI to target the configured upstream,
/// preserving the path and query string.
fn rewrite_uri(original: &Uri, upstream: &Uri) -> Result<Uri> {
    let authority = upstream
        .authority()
        .ok_or_else(|| GateError::InvalidUpstream("upstream has no authority".into()))?;

    let scheme = upstream
        .scheme()
        .ok_or_else(|| GateError::InvalidUpstream("upstream has no scheme".into()))?;

    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| GateError::Internal(format!("failed to build upstream URI: {e}")))
}

fn stream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (parts, body) = upstream_resp.into_parts();
    Response::from_parts(parts, body.map_err(|e| -> StdError { Box::new(e) }).boxed())
}
