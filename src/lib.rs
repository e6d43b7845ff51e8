//!
//! An adaptive rate limiting and abuse mitigation gateway for HTTP APIs,
//! built on [Hyper].
//!
//! Every request is attributed to a client identity, checked against a
//! trust whitelist and a temporary-block list, and counted against a quota
//! derived from the caller's plan and the route it targets. Clients that
//! keep exceeding their quota are escalated into a temporary block.
//!
//! [Hyper]: https://hyper.rs/

pub mod clock;
pub mod config;
pub mod control;
pub mod counter;
pub mod error;
pub mod gate;
pub mod headers;
pub mod identity;
pub mod proxy;
pub mod quota;
pub mod routes;
pub mod server;
pub mod state;
pub mod status;
pub mod violations;
pub mod whitelist;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{Config, RuntimeConfig};
pub use counter::{FixedWindowCounter, Verdict, WindowCounter};
pub use error::GateError;
pub use gate::{Decision, Denial, ThrottleGate};
pub use identity::{ClientIdentity, IdentityResolver, Principal};
pub use proxy::{BoxBody, HttpClient, build_client, full, handle_request};
pub use quota::{Plan, QuotaPolicy, RouteOverride, effective_limit};
pub use routes::{RouteMetadata, RouteTable};
pub use server::{serve, shutdown_signal, spawn_sweeper};
pub use state::AppState;
pub use status::{QuotaStatus, QuotaStatusReporter, StaticUserDirectory, UserDirectory};
pub use violations::{TrackerSettings, ViolationTracker};
pub use whitelist::WhitelistRegistry;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GateError>;
