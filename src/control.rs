//! The gateway's own HTTP surface, mounted under a configurable prefix and
//! answered before the throttle gate runs.
//!
//! `GET {prefix}/quota` reports the calling principal's quota. Everything
//! under `{prefix}/admin/` is the operator surface and requires
//! `Authorization: Bearer <token>`; it answers 404 when no token is
//! configured. Blocked addresses are refused before the token is checked,
//! and a rejected token counts as a violation of the caller's address.

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::identity::Principal;
use crate::proxy::{BoxBody, StdError, full};
use crate::state::AppState;
use crate::{GateError, Result};

#[derive(Debug, Deserialize)]
struct AddressBody {
    address: String,
}

#[derive(Debug, Deserialize)]
struct BlockBody {
    address: String,
    duration_secs: u64,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct WhitelistView {
    addresses: Vec<String>,
}

/// Returns `true` if `path` belongs to the control surface under `prefix`.
pub fn is_control_path(prefix: &str, path: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Serves one control request received from `peer`.
pub async fn handle<B>(
    req: Request<B>,
    state: &AppState,
    peer: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let path = req.uri().path().to_owned();
    let rest = path
        .strip_prefix(state.control.prefix.as_str())
        .unwrap_or_default();
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    let method = req.method().clone();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["quota"]) => {
            let principal = req
                .extensions()
                .get::<Principal>()
                .copied()
                .ok_or(GateError::Unauthorized)?;
            let status = state.reporter.status(principal.user_id).await?;
            json(StatusCode::OK, &status)
        }
        (_, ["admin", admin @ ..]) => {
            guard_operator(req.headers(), state, peer)?;
            let admin = admin.to_vec();
            operator(req, state, &method, &admin).await
        }
        _ => Err(GateError::NotFound(req.uri().path().to_owned())),
    }
}

async fn operator<B>(
    req: Request<B>,
    state: &AppState,
    method: &Method,
    segments: &[&str],
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    match (method, segments) {
        (&Method::GET, ["whitelist"]) => whitelist_view(state),
        (&Method::POST, ["whitelist"]) => {
            let body: AddressBody = read_json(req).await?;
            let address = validate_ip(&body.address)?;
            state.whitelist.add(&address);
            whitelist_view(state).map(|mut r| {
                *r.status_mut() = StatusCode::CREATED;
                r
            })
        }
        (&Method::POST, ["whitelist", "reset"]) => {
            state.whitelist.reset();
            info!("whitelist reset to loopback");
            whitelist_view(state)
        }
        (&Method::DELETE, ["whitelist", address]) => {
            state.whitelist.remove(address);
            no_content()
        }
        (&Method::GET, ["violations"]) => json(StatusCode::OK, &state.violations.get_all_violations()),
        (&Method::GET, ["blocks"]) => json(StatusCode::OK, &state.violations.get_blocked_ips()),
        (&Method::POST, ["blocks"]) => {
            let body: BlockBody = read_json(req).await?;
            let address = validate_ip(&body.address)?;
            if body.duration_secs == 0 {
                return Err(GateError::BadRequest(
                    "duration_secs must be positive".into(),
                ));
            }
            state
                .violations
                .block_ip(&address, body.duration_secs, body.reason.as_deref());
            json(StatusCode::CREATED, &state.violations.get_blocked_ips())
        }
        (&Method::DELETE, ["blocks", address]) => {
            state.violations.unblock_ip(address);
            no_content()
        }
        (&Method::GET, ["users", id, "quota"]) => {
            let user_id = id
                .parse::<u64>()
                .map_err(|_| GateError::BadRequest(format!("invalid user id: {id}")))?;
            json(StatusCode::OK, &state.reporter.status(user_id).await?)
        }
        _ => Err(GateError::NotFound(req.uri().path().to_owned())),
    }
}

fn guard_operator(headers: &HeaderMap, state: &AppState, peer: SocketAddr) -> Result<()> {
    let address = state.gate.resolver().address(headers, Some(peer));
    let trusted = state.gate.screen(&address).map_err(GateError::from)?;

    match authorize(headers, state.control.token.as_deref()) {
        Err(GateError::Unauthorized) if !trusted => {
            let record = state.violations.record_violation(&address);
            warn!(address = %address, violations = record.count, "operator token rejected");
            Err(GateError::Unauthorized)
        }
        outcome => outcome,
    }
}

fn authorize(headers: &HeaderMap, token: Option<&str>) -> Result<()> {
    let Some(token) = token else {
        return Err(GateError::NotFound("operator surface is disabled".into()));
    };

    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    if presented.is_some_and(|p| constant_time_eq(p.as_bytes(), token.as_bytes())) {
        Ok(())
    } else {
        warn!("operator request with missing or invalid token");
        Err(GateError::Unauthorized)
    }
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn validate_ip(address: &str) -> Result<String> {
    let trimmed = address.trim();
    trimmed
        .parse::<IpAddr>()
        .map(|_| trimmed.to_owned())
        .map_err(|_| GateError::InvalidAddress(address.to_owned()))
}

async fn read_json<B, T>(req: Request<B>) -> Result<T>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
    T: serde::de::DeserializeOwned,
{
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| {
            let e: StdError = e.into();
            GateError::BadRequest(format!("failed to read body: {e}"))
        })?
        .to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn whitelist_view(state: &AppState) -> Result<Response<BoxBody>> {
    json(
        StatusCode::OK,
        &WhitelistView {
            addresses: state.whitelist.list().into_iter().collect(),
        },
    )
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<BoxBody>> {
    let body = serde_json::to_vec(value).map_err(|e| GateError::Internal(e.to_string()))?;
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(full(body))?)
}

fn no_content() -> Result<Response<BoxBody>> {
    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(full(Bytes::new()))?)
}
