//! Quota status reporting for clients.
//!
//! Reports the plan, limits, current usage and reset instants for a user.
//! Limits are the enforced quota restated per hour and per minute. Admins
//! are unlimited and never touch the counter. Reporting has no side
//! effects.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::SharedClock;
use crate::config::UserConfig;
use crate::counter::WindowCounter;
use crate::quota::{Plan, QuotaPolicy};
use crate::{GateError, Result};

const HOUR: Duration = Duration::from_secs(60 * 60);
const MINUTE: Duration = Duration::from_secs(60);

/// What the directory knows about a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserAccount {
    pub plan: Plan,
    pub is_admin: bool,
}

/// User and plan lookup.
#[async_trait]
pub trait UserDirectory: Send + Sync + fmt::Debug {
    async fn find(&self, user_id: u64) -> Option<UserAccount>;
}

/// A directory fixed at startup.
#[derive(Debug, Default, Clone)]
pub struct StaticUserDirectory {
    users: HashMap<u64, UserAccount>,
}

impl StaticUserDirectory {
    pub fn new(users: impl IntoIterator<Item = (u64, UserAccount)>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }

    pub fn from_config(users: &[UserConfig]) -> Self {
        Self::new(users.iter().map(|u| {
            (
                u.id,
                UserAccount {
                    plan: u.plan,
                    is_admin: u.admin,
                },
            )
        }))
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn find(&self, user_id: u64) -> Option<UserAccount> {
        self.users.get(&user_id).copied()
    }
}

/// Limits for one window. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    pub limit: Option<u64>,
    pub used: u64,
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl WindowStatus {
    fn unlimited() -> Self {
        Self {
            limit: None,
            used: 0,
            remaining: None,
            reset_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub user_id: u64,
    pub plan: Plan,
    pub is_admin: bool,
    pub hourly: WindowStatus,
    pub per_minute: WindowStatus,
}

/// Answers "how much quota do I have left".
#[derive(Debug, Clone)]
pub struct QuotaStatusReporter {
    users: Arc<dyn UserDirectory>,
    counter: Option<Arc<dyn WindowCounter>>,
    policy: QuotaPolicy,
    clock: SharedClock,
}

impl QuotaStatusReporter {
    /// Without a `counter`, usage is reported as zero.
    pub fn new(
        users: Arc<dyn UserDirectory>,
        counter: Option<Arc<dyn WindowCounter>>,
        policy: QuotaPolicy,
        clock: SharedClock,
    ) -> Self {
        Self {
            users,
            counter,
            policy,
            clock,
        }
    }

    pub async fn status(&self, user_id: u64) -> Result<QuotaStatus> {
        let account = self
            .users
            .find(user_id)
            .await
            .ok_or(GateError::UserNotFound(user_id))?;

        if account.is_admin {
            return Ok(QuotaStatus {
                user_id,
                plan: account.plan,
                is_admin: true,
                hourly: WindowStatus::unlimited(),
                per_minute: WindowStatus::unlimited(),
            });
        }

        let hourly = self.policy.limit_per(account.plan, HOUR);
        let per_minute = self.policy.limit_per(account.plan, MINUTE);
        let now = self.clock.now();
        let prefix = format!("user-{user_id}-");

        Ok(QuotaStatus {
            user_id,
            plan: account.plan,
            is_admin: false,
            hourly: self.window(&prefix, hourly, HOUR, now).await,
            per_minute: self.window(&prefix, per_minute, MINUTE, now).await,
        })
    }

    async fn window(
        &self,
        prefix: &str,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> WindowStatus {
        let used = match &self.counter {
            Some(counter) => counter.usage(prefix, window).await,
            None => 0,
        };

        WindowStatus {
            limit: Some(limit),
            used,
            remaining: Some(limit.saturating_sub(used)),
            reset_at: Some(next_boundary(now, window)),
        }
    }
}

/// Start of the next epoch-aligned `window` after `now`.
fn next_boundary(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1);
    let now_ms = now.timestamp_millis();
    let next = now_ms - now_ms.rem_euclid(window_ms) + window_ms;
    DateTime::from_timestamp_millis(next).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
