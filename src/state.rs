//! Process-wide state built once from the validated configuration.

use std::sync::Arc;
use std::time::Duration;

use hyper::Uri;

use crate::clock::{self, SharedClock};
use crate::config::{ControlConfig, IdentityConfig, RuntimeConfig};
use crate::counter::{FixedWindowCounter, WindowCounter};
use crate::gate::ThrottleGate;
use crate::identity::IdentityResolver;
use crate::status::{QuotaStatusReporter, StaticUserDirectory, UserDirectory};
use crate::violations::ViolationTracker;
use crate::whitelist::WhitelistRegistry;

/// Everything a request handler needs, shared behind an `Arc`.
#[derive(Debug)]
pub struct AppState {
    pub gate: ThrottleGate,
    pub whitelist: WhitelistRegistry,
    pub violations: ViolationTracker,
    pub counter: Arc<dyn WindowCounter>,
    pub reporter: QuotaStatusReporter,
    pub identity: IdentityConfig,
    pub control: ControlConfig,
    pub upstream: Uri,
    pub request_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub sweep_interval: Option<Duration>,
}

impl AppState {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_clock(config, clock::system())
    }

    /// Wires all components to the same `clock`.
    pub fn with_clock(config: RuntimeConfig, clock: SharedClock) -> Self {
        let whitelist = WhitelistRegistry::in_memory(&config.whitelist);
        let violations = ViolationTracker::in_memory_with_clock(config.tracker, clock.clone());
        let counter: Arc<dyn WindowCounter> = Arc::new(FixedWindowCounter::new(clock.clone()));
        let users: Arc<dyn UserDirectory> =
            Arc::new(StaticUserDirectory::from_config(&config.users));

        let gate = ThrottleGate::builder(Arc::clone(&counter), config.policy)
            .resolver(IdentityResolver::new(config.trusted_proxies))
            .users(Arc::clone(&users))
            .whitelist(whitelist.clone())
            .violations(violations.clone())
            .routes(Arc::new(config.routes))
            .clock(clock.clone())
            .build();

        let reporter = QuotaStatusReporter::new(
            users,
            Some(Arc::clone(&counter)),
            config.policy,
            clock,
        );

        Self {
            gate,
            whitelist,
            violations,
            counter,
            reporter,
            identity: config.identity,
            control: config.control,
            upstream: config.upstream,
            request_timeout: config.request_timeout,
            pool_idle_timeout: config.pool_idle_timeout,
            max_concurrent_requests: config.max_concurrent_requests,
            sweep_interval: config.sweep_interval,
        }
    }
}
