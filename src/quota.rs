//! Quota policy: base limit × plan multiplier, superseded by route overrides.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Subscription tier of an authenticated caller. Anonymous callers are
/// treated as the lowest tier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Basic,
    Premium,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Premium => "premium",
        }
    }

    /// Factor applied to the base limit for this plan.
    pub fn multiplier(&self) -> u64 {
        match self {
            Self::Premium => 2,
            Self::Free | Self::Basic => 1,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-route quota that replaces the computed plan quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteOverride {
    pub limit: u64,
    pub ttl_ms: u64,
}

/// The limit and window handed to the window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub window: Duration,
}

/// Computes the effective request limit.
///
/// A route override wins outright; otherwise the base limit is scaled by
/// the plan multiplier.
pub fn effective_limit(base_limit: u64, plan: Plan, route: Option<&RouteOverride>) -> u64 {
    match route {
        Some(route) => route.limit,
        None => base_limit.saturating_mul(plan.multiplier()),
    }
}

/// The configured base quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub base_limit: u64,
    pub window: Duration,
}

impl QuotaPolicy {
    pub fn new(base_limit: u64, window: Duration) -> Self {
        Self { base_limit, window }
    }

    /// Resolves the full quota (limit and window) for a caller on a route.
    pub fn resolve(&self, plan: Plan, route: Option<&RouteOverride>) -> Quota {
        let window = route.map_or(self.window, |r| Duration::from_millis(r.ttl_ms));
        Quota {
            limit: effective_limit(self.base_limit, plan, route),
            window,
        }
    }

    /// The unrouted limit for `plan`, restated over `span` and rounded down.
    ///
    /// With a one-minute window, `limit_per(plan, 1 min)` is exactly the
    /// enforced limit.
    pub fn limit_per(&self, plan: Plan, span: Duration) -> u64 {
        let quota = self.resolve(plan, None);
        let window_ms = quota.window.as_millis().max(1);
        let scaled = u128::from(quota.limit) * span.as_millis() / window_ms;
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }
}
