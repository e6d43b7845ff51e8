//! The throttle gate: the per-request decision that ties identity,
//! whitelist, blocks, quota policy and the window counter together.
//!
//! Evaluation order:
//!
//! 1. **Identity**: the raw address and tracker key are resolved.
//! 2. **Whitelist**: a trusted address is allowed immediately, even if
//!    it is currently blocked.
//! 3. **Block**: a blocked address is denied with a permission error and
//!    no further violation is recorded.
//! 4. **Quota**: base limit × plan multiplier, or the route override. The
//!    plan comes from the user directory, keyed by the principal's id;
//!    admin accounts are not metered.
//! 5. **Counting**: the window counter decides, keyed by tracker.
//! 6. **Escalation**: a counter denial records a violation against the
//!    address, which may block it for subsequent requests.
//!
//! Whitelisting, violations and blocks are keyed by raw address; counting
//! is keyed by the full tracker.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hyper::Request;
use tracing::{debug, warn};

use crate::clock::{self, SharedClock};
use crate::counter::{Verdict, WindowCounter};
use crate::identity::{ClientIdentity, IdentityResolver, Principal};
use crate::quota::{Plan, QuotaPolicy, RouteOverride};
use crate::routes::{RouteMetadata, RouteTable};
use crate::status::{UserAccount, UserDirectory};
use crate::violations::ViolationTracker;
use crate::whitelist::WhitelistRegistry;
use crate::{GateError, Result};

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed. Carries the counter verdict unless the
    /// address was whitelisted.
    Allow(Option<Verdict>),
    Deny(Denial),
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// The address is under an active block.
    Blocked {
        address: String,
        retry_after_secs: Option<u64>,
    },
    /// The quota for the current window is exhausted.
    Throttled {
        verdict: Verdict,
        retry_after_secs: u64,
    },
}

impl From<Denial> for GateError {
    fn from(denial: Denial) -> Self {
        match denial {
            Denial::Blocked {
                address,
                retry_after_secs,
            } => Self::Blocked {
                address,
                retry_after_secs,
            },
            Denial::Throttled {
                verdict,
                retry_after_secs,
            } => Self::Throttled {
                limit: verdict.limit,
                remaining: 0,
                reset_at: verdict.reset_at,
                retry_after_secs,
            },
        }
    }
}

/// Composes whitelist, violation tracking, quota policy and the window
/// counter into one allow/deny decision.
///
/// The whitelist and tracker are optional; without them the gate degrades
/// to pure quota counting.
#[derive(Debug, Clone)]
pub struct ThrottleGate {
    resolver: IdentityResolver,
    whitelist: Option<WhitelistRegistry>,
    violations: Option<ViolationTracker>,
    users: Option<Arc<dyn UserDirectory>>,
    counter: Arc<dyn WindowCounter>,
    policy: QuotaPolicy,
    routes: Arc<dyn RouteMetadata>,
    clock: SharedClock,
}

/// Builder for [`ThrottleGate`].
#[derive(Debug)]
pub struct ThrottleGateBuilder {
    resolver: IdentityResolver,
    whitelist: Option<WhitelistRegistry>,
    violations: Option<ViolationTracker>,
    users: Option<Arc<dyn UserDirectory>>,
    counter: Arc<dyn WindowCounter>,
    policy: QuotaPolicy,
    routes: Arc<dyn RouteMetadata>,
    clock: SharedClock,
}

impl ThrottleGateBuilder {
    pub fn resolver(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Source of each principal's plan and admin flag.
    pub fn users(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn whitelist(mut self, whitelist: WhitelistRegistry) -> Self {
        self.whitelist = Some(whitelist);
        self
    }

    pub fn violations(mut self, tracker: ViolationTracker) -> Self {
        self.violations = Some(tracker);
        self
    }

    pub fn routes(mut self, routes: Arc<dyn RouteMetadata>) -> Self {
        self.routes = routes;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> ThrottleGate {
        if self.whitelist.is_none() {
            warn!("no whitelist registry wired, whitelist checks are skipped");
        }
        if self.violations.is_none() {
            warn!("no violation tracker wired, block checks and escalation are skipped");
        }
        if self.users.is_none() {
            warn!("no user directory wired, every caller gets the lowest plan");
        }

        ThrottleGate {
            resolver: self.resolver,
            whitelist: self.whitelist,
            violations: self.violations,
            users: self.users,
            counter: self.counter,
            policy: self.policy,
            routes: self.routes,
            clock: self.clock,
        }
    }
}

impl ThrottleGate {
    /// Starts a builder around the mandatory collaborators.
    pub fn builder(counter: Arc<dyn WindowCounter>, policy: QuotaPolicy) -> ThrottleGateBuilder {
        ThrottleGateBuilder {
            resolver: IdentityResolver::default(),
            whitelist: None,
            violations: None,
            users: None,
            counter,
            policy,
            routes: Arc::new(RouteTable::default()),
            clock: clock::system(),
        }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Evaluates `req` received from `peer`.
    ///
    /// The caller's account is looked up by the [`Principal`] in the
    /// request extensions; anonymous and unknown callers get the lowest
    /// plan. The route override comes from the configured
    /// [`RouteMetadata`].
    pub async fn evaluate<B>(&self, req: &Request<B>, peer: Option<SocketAddr>) -> Decision {
        let identity = self.resolver.resolve(req, peer);
        let account = self.account(req.extensions().get::<Principal>()).await;
        let route = self.routes.override_for(req.method(), req.uri().path());

        let (plan, metered) = match account {
            Some(account) => (account.plan, !account.is_admin),
            None => (Plan::default(), true),
        };
        self.decide(&identity, plan, metered, route.as_ref()).await
    }

    /// Like [`ThrottleGate::evaluate`] but maps a denial to [`GateError`].
    pub async fn check<B>(&self, req: &Request<B>, peer: Option<SocketAddr>) -> Result<Option<Verdict>> {
        match self.evaluate(req, peer).await {
            Decision::Allow(verdict) => Ok(verdict),
            Decision::Deny(denial) => Err(denial.into()),
        }
    }

    /// Evaluates an already-resolved identity on `plan`.
    pub async fn evaluate_identity(
        &self,
        identity: &ClientIdentity,
        plan: Plan,
        route: Option<&RouteOverride>,
    ) -> Decision {
        self.decide(identity, plan, true, route).await
    }

    /// Runs only the whitelist and block checks for `address`.
    ///
    /// `Ok(true)` means the address is whitelisted, `Ok(false)` that it
    /// may proceed to counting.
    pub fn screen(&self, address: &str) -> std::result::Result<bool, Denial> {
        if self
            .whitelist
            .as_ref()
            .is_some_and(|w| w.is_trusted(address))
        {
            return Ok(true);
        }

        if let Some(until) = self
            .violations
            .as_ref()
            .and_then(|v| v.blocked_until(address))
        {
            warn!(address, %until, "request from blocked address rejected");
            return Err(Denial::Blocked {
                address: address.to_owned(),
                retry_after_secs: Some(self.seconds_until(until)),
            });
        }

        Ok(false)
    }

    async fn account(&self, principal: Option<&Principal>) -> Option<UserAccount> {
        let user_id = principal?.user_id;
        let account = self.users.as_ref()?.find(user_id).await;
        if account.is_none() {
            debug!(user_id, "principal not in user directory, using lowest plan");
        }
        account
    }

    async fn decide(
        &self,
        identity: &ClientIdentity,
        plan: Plan,
        metered: bool,
        route: Option<&RouteOverride>,
    ) -> Decision {
        let address = identity.address();

        match self.screen(address) {
            Ok(true) => {
                debug!(address, "whitelisted address, skipping rate limit");
                return Decision::Allow(None);
            }
            Ok(false) => {}
            Err(denial) => return Decision::Deny(denial),
        }

        if !metered {
            debug!(tracker = identity.tracker(), "admin account, not metered");
            return Decision::Allow(None);
        }

        let quota = self.policy.resolve(plan, route);
        let verdict = self
            .counter
            .hit(identity.tracker(), quota.limit, quota.window)
            .await;

        if verdict.allowed {
            debug!(
                tracker = identity.tracker(),
                limit = verdict.limit,
                remaining = verdict.remaining,
                "request allowed"
            );
            return Decision::Allow(Some(verdict));
        }

        let violations = self
            .violations
            .as_ref()
            .map(|v| v.record_violation(address).count);
        warn!(
            tracker = identity.tracker(),
            limit = verdict.limit,
            plan = %plan,
            violations,
            "rate limit exceeded"
        );

        Decision::Deny(Denial::Throttled {
            retry_after_secs: verdict.retry_after_secs(self.clock.now()),
            verdict,
        })
    }

    fn seconds_until(&self, until: DateTime<Utc>) -> u64 {
        let millis = until
            .signed_duration_since(self.clock.now())
            .num_milliseconds()
            .max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}
