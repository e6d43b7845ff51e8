//! Configuration loading, validation, and pre-compiled runtime state.
//!
//! The gateway reads its YAML configuration exactly once at startup.
//! Route patterns are compiled and whitelist seeds validated at load time,
//! so request handling never touches the filesystem or compiles a regex.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use hyper::Method;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::quota::{Plan, QuotaPolicy, RouteOverride};
use crate::routes::{RouteRule, RouteTable};
use crate::violations::{
    DEFAULT_BLOCK_DURATION, DEFAULT_VIOLATION_THRESHOLD, DEFAULT_VIOLATION_WINDOW, TrackerSettings,
};
use crate::{GateError, Result};

/// Default total request timeout covering the entire upstream round-trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle timeout for pooled connections before they are closed.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum number of concurrent in-flight requests the gateway
/// will handle before returning 503 Service Unavailable.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1000;

/// Default socket address the gateway binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8100";

/// Default requests allowed per window for the lowest plan.
pub const DEFAULT_BASE_LIMIT: u64 = 100;

/// Default counting window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default interval between background sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default path prefix for the control surface.
pub const DEFAULT_CONTROL_PREFIX: &str = "/_gatekeeper";

/// Raw configuration as deserialized from the YAML file.
///
/// This struct maps directly to the on-disk schema. After loading, it is
/// transformed into a [`RuntimeConfig`] holding compiled route rules and a
/// validated upstream URI.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Socket address the gateway listens on (default `"127.0.0.1:8100"`).
    #[serde(default)]
    pub listen: Option<String>,
    /// The protected API (e.g. `"http://localhost:3000"`).
    #[serde(default)]
    pub upstream: Option<String>,
    /// Total request timeout in milliseconds covering the upstream
    /// round-trip (default: 30000). Requests exceeding this receive 504.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Idle timeout in milliseconds for pooled connections (default: 60000).
    #[serde(default)]
    pub pool_idle_timeout_ms: Option<u64>,
    /// Maximum concurrent in-flight requests before returning 503
    /// Service Unavailable (default: 1000).
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub control: ControlConfig,
    /// Static user directory backing the quota status endpoint.
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// Throttling and escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Requests per window for the lowest plan (default: 100).
    #[serde(default = "default_base_limit")]
    pub base_limit: u64,
    /// Counting window in milliseconds (default: 60000).
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Throttle denials within the violation window that trigger a block
    /// (default: 10).
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,
    /// Violation window in seconds (default: 3600).
    #[serde(default = "default_violation_window_secs")]
    pub violation_window_secs: u64,
    /// Duration of an automatic block in seconds (default: 3600).
    #[serde(default = "default_block_duration_secs")]
    pub block_duration_secs: u64,
    /// Addresses trusted in addition to loopback. Must be valid IPs.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Seconds between background sweeps (default: 60). `0` disables the
    /// sweeper; expiry stays correct without it.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Per-route overrides, first match wins.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

fn default_base_limit() -> u64 {
    DEFAULT_BASE_LIMIT
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW.as_millis() as u64
}

fn default_violation_threshold() -> u32 {
    DEFAULT_VIOLATION_THRESHOLD
}

fn default_violation_window_secs() -> u64 {
    DEFAULT_VIOLATION_WINDOW.as_secs()
}

fn default_block_duration_secs() -> u64 {
    DEFAULT_BLOCK_DURATION.as_secs()
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_limit: default_base_limit(),
            window_ms: default_window_ms(),
            violation_threshold: default_violation_threshold(),
            violation_window_secs: default_violation_window_secs(),
            block_duration_secs: default_block_duration_secs(),
            whitelist: Vec::new(),
            sweep_interval_secs: default_sweep_interval_secs(),
            routes: Vec::new(),
        }
    }
}

/// A route with its own quota.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    /// Regex matched against the request path.
    pub path: String,
    /// HTTP method; any method when absent.
    #[serde(default)]
    pub method: Option<String>,
    pub limit: u64,
    /// Window in milliseconds; the global window when absent.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

/// How callers are identified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    /// Header through which the authentication layer passes the
    /// authenticated user id. Plan and admin flag come from the user
    /// directory, never from the request.
    pub user_id: String,
    /// Peers whose `X-Forwarded-For` is honoured. Empty honours it from
    /// every peer, which lets any client pick its own address; set this
    /// whenever the gateway is reachable directly.
    pub trusted_proxies: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_id: "x-user-id".into(),
            trusted_proxies: Vec::new(),
        }
    }
}

/// The gateway's own HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    pub prefix: String,
    /// Bearer token for the operator routes. Operator routes answer 404
    /// when unset.
    pub token: Option<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_CONTROL_PREFIX.into(),
            token: None,
        }
    }
}

/// One entry of the static user directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserConfig {
    pub id: u64,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub admin: bool,
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and consumed by [`crate::state::AppState`].
#[derive(Debug)]
pub struct RuntimeConfig {
    pub listen: SocketAddr,
    /// Validated upstream URI; always has an authority.
    pub upstream: hyper::Uri,
    /// Total request timeout for the upstream round-trip. Expiry yields 504.
    pub request_timeout: Duration,
    pub pool_idle_timeout: Duration,
    /// Maximum concurrent in-flight requests. Overflow yields 503.
    pub max_concurrent_requests: usize,
    pub policy: QuotaPolicy,
    pub tracker: TrackerSettings,
    /// Validated whitelist seed.
    pub whitelist: Vec<String>,
    /// `None` disables the background sweeper.
    pub sweep_interval: Option<Duration>,
    pub routes: RouteTable,
    pub identity: IdentityConfig,
    /// Validated `identity.trusted_proxies`.
    pub trusted_proxies: Vec<IpAddr>,
    pub control: ControlConfig,
    pub users: Vec<UserConfig>,
}

/// Validates the upstream address string.
fn validate_upstream(address: Option<&str>) -> Result<hyper::Uri> {
    let address = address
        .filter(|a| !a.is_empty())
        .ok_or_else(|| GateError::InvalidUpstream("an upstream must be configured".into()))?;

    let uri = address
        .parse::<hyper::Uri>()
        .map_err(|e| GateError::InvalidUpstream(format!("{e}")))?;

    uri.authority().ok_or_else(|| {
        GateError::InvalidUpstream(format!("upstream URI has no authority: {address}"))
    })?;

    Ok(uri)
}

fn compile_route(route: &RouteConfig, default_ttl_ms: u64) -> Result<RouteRule> {
    let pattern = Regex::new(&route.path)
        .map_err(|e| GateError::Config(format!("invalid route pattern {}: {e}", route.path)))?;

    let method = route
        .method
        .as_deref()
        .map(|m| {
            Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|e| GateError::Config(format!("invalid route method {m}: {e}")))
        })
        .transpose()?;

    let ttl_ms = route.ttl_ms.unwrap_or(default_ttl_ms);
    if ttl_ms == 0 {
        return Err(GateError::Config(format!(
            "route window must be positive: {}",
            route.path
        )));
    }

    Ok(RouteRule {
        pattern,
        method,
        quota: RouteOverride {
            limit: route.limit,
            ttl_ms,
        },
    })
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    ///
    /// Returns a [`GateError::Config`] if the file cannot be opened or
    /// its contents fail YAML deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            GateError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| GateError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates all fields and compiles route patterns, producing a
    /// [`RuntimeConfig`].
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        let upstream = validate_upstream(self.upstream.as_deref())?;

        let listen_str = self.listen.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen = listen_str.parse::<SocketAddr>().map_err(|e| {
            GateError::Config(format!("invalid listen address \"{listen_str}\": {e}"))
        })?;

        let rl = self.rate_limit;
        if rl.window_ms == 0 {
            return Err(GateError::Config("rate limit window must be positive".into()));
        }
        if rl.violation_threshold == 0 {
            return Err(GateError::Config(
                "violation threshold must be positive".into(),
            ));
        }

        let whitelist = rl
            .whitelist
            .iter()
            .map(|a| {
                a.trim()
                    .parse::<IpAddr>()
                    .map(|_| a.trim().to_owned())
                    .map_err(|e| GateError::Config(format!("invalid whitelist address {a}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let trusted_proxies = self
            .identity
            .trusted_proxies
            .iter()
            .map(|a| {
                a.trim()
                    .parse::<IpAddr>()
                    .map_err(|e| GateError::Config(format!("invalid trusted proxy {a}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let routes = rl
            .routes
            .iter()
            .map(|r| compile_route(r, rl.window_ms))
            .collect::<Result<Vec<_>>>()?;

        let request_timeout = self
            .request_timeout_ms
            .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_millis);

        let pool_idle_timeout = self
            .pool_idle_timeout_ms
            .map_or(DEFAULT_POOL_IDLE_TIMEOUT, Duration::from_millis);

        let max_concurrent_requests = self
            .max_concurrent_requests
            .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS);

        let sweep_interval =
            (rl.sweep_interval_secs > 0).then(|| Duration::from_secs(rl.sweep_interval_secs));

        Ok(RuntimeConfig {
            listen,
            upstream,
            request_timeout,
            pool_idle_timeout,
            max_concurrent_requests,
            policy: QuotaPolicy::new(rl.base_limit, Duration::from_millis(rl.window_ms)),
            tracker: TrackerSettings {
                threshold: rl.violation_threshold,
                window: Duration::from_secs(rl.violation_window_secs),
                block_duration: Duration::from_secs(rl.block_duration_secs),
            },
            whitelist,
            sweep_interval,
            routes: RouteTable::new(routes),
            identity: self.identity,
            trusted_proxies,
            control: self.control,
            users: self.users,
        })
    }
}
