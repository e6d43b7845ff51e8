//! Windowed violation counting and timed address blocks.
//!
//! Every throttled request counts as one violation against its address.
//! Once an address accumulates `threshold` violations without a gap longer
//! than the violation window, it is blocked for the escalation duration.
//!
//! Expiry is lazy: a stale violation record reads as zero and an expired
//! block is deleted the next time it is looked at. [`ViolationTracker::sweep`]
//! exists only to bound memory and never changes what a read returns.
//!
//! The increment and the threshold comparison happen in one atomic step
//! inside the [`ViolationStore`], so concurrent violations from the same
//! address are each counted exactly once. Racers that all land at or past
//! the threshold each write an equivalent block; the overwrite is harmless.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{self, SharedClock};

/// Number of violations within the window that triggers a block.
pub const DEFAULT_VIOLATION_THRESHOLD: u32 = 10;

/// Maximum gap between violations before the count starts over.
pub const DEFAULT_VIOLATION_WINDOW: Duration = Duration::from_secs(60 * 60);

/// How long an automatic block lasts.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(60 * 60);

/// Reason recorded for automatic and default manual blocks.
pub const DEFAULT_BLOCK_REASON: &str = "Rate limit exceeded";

/// Violation history of one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ViolationRecord {
    pub count: u32,
    pub first_violation: DateTime<Utc>,
    pub last_violation: DateTime<Utc>,
}

impl ViolationRecord {
    fn is_live(&self, now: DateTime<Utc>, window: TimeDelta) -> bool {
        now.signed_duration_since(self.last_violation) <= window
    }
}

/// An active or expired block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockRecord {
    pub blocked_at: DateTime<Utc>,
    pub blocked_until: DateTime<Utc>,
    pub reason: String,
}

impl BlockRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.blocked_until
    }
}

/// Storage for violation records, keyed by address.
pub trait ViolationStore: Send + Sync + fmt::Debug {
    /// Applies one violation atomically and returns the updated record.
    ///
    /// If the gap since the previous violation exceeds `window`, the count
    /// restarts at 1 and `first_violation` moves to `now`.
    fn record(&self, address: &str, now: DateTime<Utc>, window: TimeDelta) -> ViolationRecord;
    fn get(&self, address: &str) -> Option<ViolationRecord>;
    fn remove(&self, address: &str);
    fn entries(&self) -> Vec<(String, ViolationRecord)>;
    /// Deletes records that are no longer live; returns how many went.
    fn purge_stale(&self, now: DateTime<Utc>, window: TimeDelta) -> usize;
    fn clear(&self);
}

/// Storage for blocks, keyed by address.
pub trait BlockStore: Send + Sync + fmt::Debug {
    /// Creates or overwrites the block for `address`.
    fn insert(&self, address: &str, record: BlockRecord);
    fn get(&self, address: &str) -> Option<BlockRecord>;
    fn remove(&self, address: &str);
    /// Deletes the block only if it has expired at `now`, so a block
    /// written concurrently is never lost. Returns `true` if deleted.
    fn remove_expired(&self, address: &str, now: DateTime<Utc>) -> bool;
    fn entries(&self) -> Vec<(String, BlockRecord)>;
    /// Deletes every expired block; returns how many went.
    fn purge_expired(&self, now: DateTime<Utc>) -> usize;
    fn clear(&self);
}

/// In-process [`ViolationStore`].
#[derive(Debug, Default)]
pub struct InMemoryViolations {
    records: DashMap<String, ViolationRecord>,
}

impl ViolationStore for InMemoryViolations {
    fn record(&self, address: &str, now: DateTime<Utc>, window: TimeDelta) -> ViolationRecord {
        let mut entry = self
            .records
            .entry(address.to_owned())
            .or_insert(ViolationRecord {
                count: 0,
                first_violation: now,
                last_violation: now,
            });

        let record = entry.value_mut();
        if record.count == 0 || !record.is_live(now, window) {
            record.count = 1;
            record.first_violation = now;
        } else {
            record.count = record.count.saturating_add(1);
        }
        record.last_violation = now;
        *record
    }

    fn get(&self, address: &str) -> Option<ViolationRecord> {
        self.records.get(address).map(|r| *r.value())
    }

    fn remove(&self, address: &str) {
        self.records.remove(address);
    }

    fn entries(&self) -> Vec<(String, ViolationRecord)> {
        self.records
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    fn purge_stale(&self, now: DateTime<Utc>, window: TimeDelta) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.is_live(now, window));
        before.saturating_sub(self.records.len())
    }

    fn clear(&self) {
        self.records.clear();
    }
}

/// In-process [`BlockStore`].
#[derive(Debug, Default)]
pub struct InMemoryBlocks {
    records: DashMap<String, BlockRecord>,
}

impl BlockStore for InMemoryBlocks {
    fn insert(&self, address: &str, record: BlockRecord) {
        self.records.insert(address.to_owned(), record);
    }

    fn get(&self, address: &str) -> Option<BlockRecord> {
        self.records.get(address).map(|r| r.value().clone())
    }

    fn remove(&self, address: &str) {
        self.records.remove(address);
    }

    fn remove_expired(&self, address: &str, now: DateTime<Utc>) -> bool {
        self.records
            .remove_if(address, |_, record| !record.is_active(now))
            .is_some()
    }

    fn entries(&self) -> Vec<(String, BlockRecord)> {
        self.records
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.is_active(now));
        before.saturating_sub(self.records.len())
    }

    fn clear(&self) {
        self.records.clear();
    }
}

/// Escalation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    pub threshold: u32,
    pub window: Duration,
    pub block_duration: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_VIOLATION_THRESHOLD,
            window: DEFAULT_VIOLATION_WINDOW,
            block_duration: DEFAULT_BLOCK_DURATION,
        }
    }
}

/// A violation as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationSummary {
    pub address: String,
    pub count: u32,
    pub first_violation: DateTime<Utc>,
    pub last_violation: DateTime<Utc>,
}

/// An active block as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedAddress {
    pub address: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of one [`ViolationTracker::sweep`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub violations: usize,
    pub blocks: usize,
}

/// Counts violations per address and escalates repeat offenders to blocks.
///
/// Cheap to clone; clones share the same stores. No operation fails: a
/// missing record is always the zero/unblocked state.
#[derive(Debug, Clone)]
pub struct ViolationTracker {
    violations: Arc<dyn ViolationStore>,
    blocks: Arc<dyn BlockStore>,
    settings: TrackerSettings,
    window: TimeDelta,
    clock: SharedClock,
}

impl ViolationTracker {
    pub fn new(
        violations: Arc<dyn ViolationStore>,
        blocks: Arc<dyn BlockStore>,
        settings: TrackerSettings,
        clock: SharedClock,
    ) -> Self {
        Self {
            violations,
            blocks,
            window: to_delta(settings.window),
            settings,
            clock,
        }
    }

    /// A tracker over in-memory stores using the system clock.
    pub fn in_memory(settings: TrackerSettings) -> Self {
        Self::in_memory_with_clock(settings, clock::system())
    }

    pub fn in_memory_with_clock(settings: TrackerSettings, clock: SharedClock) -> Self {
        Self::new(
            Arc::new(InMemoryViolations::default()),
            Arc::new(InMemoryBlocks::default()),
            settings,
            clock,
        )
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// Counts one violation and blocks the address once the threshold is
    /// reached. Returns the updated record.
    pub fn record_violation(&self, address: &str) -> ViolationRecord {
        let now = self.clock.now();
        let record = self.violations.record(address, now, self.window);
        debug!(address, count = record.count, "violation recorded");

        if record.count >= self.settings.threshold {
            warn!(
                address,
                count = record.count,
                threshold = self.settings.threshold,
                "violation threshold reached, blocking address"
            );
            self.block_at(
                address,
                now,
                self.settings.block_duration,
                DEFAULT_BLOCK_REASON,
            );
        }
        record
    }

    pub fn is_blocked(&self, address: &str) -> bool {
        self.blocked_until(address).is_some()
    }

    /// Returns the expiry of the active block on `address`, clearing an
    /// expired block as a side effect.
    pub fn blocked_until(&self, address: &str) -> Option<DateTime<Utc>> {
        let record = self.blocks.get(address)?;
        let now = self.clock.now();
        if record.is_active(now) {
            return Some(record.blocked_until);
        }
        if self.blocks.remove_expired(address, now) {
            debug!(address, "expired block cleared");
        }
        None
    }

    /// Blocks `address` for `duration_secs`, overwriting any existing block.
    pub fn block_ip(&self, address: &str, duration_secs: u64, reason: Option<&str>) {
        let reason = reason.unwrap_or(DEFAULT_BLOCK_REASON);
        self.block_at(
            address,
            self.clock.now(),
            Duration::from_secs(duration_secs),
            reason,
        );
        info!(address, duration_secs, reason, "address blocked");
    }

    /// Lifts the block on `address` and forgives its violations.
    pub fn unblock_ip(&self, address: &str) {
        self.blocks.remove(address);
        self.violations.remove(address);
        info!(address, "address unblocked");
    }

    /// Live violation count of `address`; 0 when absent or stale.
    pub fn get_violations(&self, address: &str) -> u32 {
        let now = self.clock.now();
        self.violations
            .get(address)
            .filter(|r| r.is_live(now, self.window))
            .map_or(0, |r| r.count)
    }

    /// Every live violation record, sorted by address. Stale records are
    /// skipped but left in place.
    pub fn get_all_violations(&self) -> Vec<ViolationSummary> {
        let now = self.clock.now();
        let mut out: Vec<_> = self
            .violations
            .entries()
            .into_iter()
            .filter(|(_, r)| r.is_live(now, self.window))
            .map(|(address, r)| ViolationSummary {
                address,
                count: r.count,
                first_violation: r.first_violation,
                last_violation: r.last_violation,
            })
            .collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }

    /// Every unexpired block, sorted by address.
    pub fn get_blocked_ips(&self) -> Vec<BlockedAddress> {
        let now = self.clock.now();
        let mut out: Vec<_> = self
            .blocks
            .entries()
            .into_iter()
            .filter(|(_, b)| b.is_active(now))
            .map(|(address, b)| BlockedAddress {
                address,
                reason: b.reason,
                blocked_at: b.blocked_at,
                expires_at: b.blocked_until,
            })
            .collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }

    pub fn clear_all(&self) {
        self.violations.clear();
        self.blocks.clear();
        info!("all violations and blocks cleared");
    }

    /// Drops stale violation records and expired blocks.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        SweepReport {
            violations: self.violations.purge_stale(now, self.window),
            blocks: self.blocks.purge_expired(now),
        }
    }

    fn block_at(&self, address: &str, now: DateTime<Utc>, duration: Duration, reason: &str) {
        self.blocks.insert(
            address,
            BlockRecord {
                blocked_at: now,
                blocked_until: add_duration(now, duration),
                reason: reason.to_owned(),
            },
        );
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// `now + duration`, saturating at the largest representable instant.
pub(crate) fn add_duration(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
