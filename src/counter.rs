//! Window counting: the collaborator that decides whether one more request
//! fits in a key's quota.
//!
//! The gate only chooses *which* key and *which* limit to ask about; the
//! counting algorithm lives behind [`WindowCounter`]. [`FixedWindowCounter`]
//! is the in-process default: epoch-aligned fixed windows held in a
//! `DashMap`, so the hot path only locks one shard.
//!
//! Alongside the windows it keeps a per-minute usage ledger covering the
//! last hour, which answers [`WindowCounter::usage`] independently of the
//! window lengths the gate counts with.
//!
//! Finished windows and old ledger buckets are pruned via
//! [`WindowCounter::retain_recent`], which should be called from a
//! background task to keep memory bounded under high-cardinality traffic.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::clock::{self, SharedClock};

/// Granularity of the usage ledger.
const USAGE_BUCKET_MS: i64 = 60_000;

/// How far back the usage ledger reaches.
const USAGE_HISTORY_MS: i64 = 60 * 60_000;

/// The counter's answer for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl Verdict {
    /// Whole seconds from `now` until the window resets, at least 1.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = self
            .reset_at
            .signed_duration_since(now)
            .num_milliseconds()
            .max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

/// A windowed request counter.
#[async_trait]
pub trait WindowCounter: Send + Sync + fmt::Debug {
    /// Counts one request for `key` against `limit` per `window` and
    /// reports whether it fits. Rejected requests are not counted.
    async fn hit(&self, key: &str, limit: u64, window: Duration) -> Verdict;

    /// Requests counted since the start of the current epoch-aligned
    /// `window` across all keys starting with `key_prefix`.
    async fn usage(&self, key_prefix: &str, window: Duration) -> u64;

    /// Drops finished windows and returns how many were dropped.
    fn retain_recent(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    start_ms: i64,
    count: u64,
}

/// In-process fixed-window counter.
#[derive(Debug)]
pub struct FixedWindowCounter {
    slots: DashMap<(String, i64), Slot>,
    ledger: DashMap<(String, i64), u64>,
    clock: SharedClock,
}

impl Default for FixedWindowCounter {
    fn default() -> Self {
        Self::new(clock::system())
    }
}

impl FixedWindowCounter {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            slots: DashMap::new(),
            ledger: DashMap::new(),
            clock,
        }
    }

    /// Number of (key, window) pairs currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.slots.len()
    }

    fn window_start(now_ms: i64, window_ms: i64) -> i64 {
        now_ms - now_ms.rem_euclid(window_ms)
    }
}

fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn reset_instant(start_ms: i64, window_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(start_ms.saturating_add(window_ms)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl WindowCounter for FixedWindowCounter {
    async fn hit(&self, key: &str, limit: u64, window: Duration) -> Verdict {
        let now_ms = self.clock.now().timestamp_millis();
        let window_ms = window_millis(window);
        let start_ms = Self::window_start(now_ms, window_ms);

        let (allowed, count) = {
            let mut slot = self
                .slots
                .entry((key.to_owned(), window_ms))
                .or_insert(Slot { start_ms, count: 0 });

            if slot.start_ms != start_ms {
                *slot = Slot { start_ms, count: 0 };
            }

            let allowed = slot.count < limit;
            if allowed {
                slot.count += 1;
            }
            (allowed, slot.count)
        };

        if allowed {
            let bucket = Self::window_start(now_ms, USAGE_BUCKET_MS);
            *self.ledger.entry((key.to_owned(), bucket)).or_insert(0) += 1;
        }

        Verdict {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: reset_instant(start_ms, window_ms),
        }
    }

    // Resolution is one ledger bucket; shorter windows report the current
    // minute and windows longer than the history are truncated to it.
    async fn usage(&self, key_prefix: &str, window: Duration) -> u64 {
        let now_ms = self.clock.now().timestamp_millis();
        let window_ms = window_millis(window).max(USAGE_BUCKET_MS);
        let start_ms = Self::window_start(now_ms, window_ms);

        self.ledger
            .iter()
            .filter(|e| {
                let (key, bucket) = e.key();
                *bucket >= start_ms && key.starts_with(key_prefix)
            })
            .map(|e| *e.value())
            .sum()
    }

    fn retain_recent(&self) -> usize {
        let now_ms = self.clock.now().timestamp_millis();
        let before = self.slots.len();
        self.slots
            .retain(|(_, window_ms), slot| slot.start_ms.saturating_add(*window_ms) > now_ms);
        self.ledger
            .retain(|(_, bucket), _| bucket.saturating_add(USAGE_HISTORY_MS) > now_ms);
        before.saturating_sub(self.slots.len())
    }
}
