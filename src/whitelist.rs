//! Trusted-address whitelist.
//!
//! Whitelisted addresses bypass both blocking and throttling. The set is
//! held behind a [`WhitelistStore`] so a deployment can swap the in-memory
//! default for a shared backend.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashSet;
use tracing::info;

/// Addresses that are trusted after every reset.
pub const LOOPBACK_ADDRESSES: [&str; 3] = ["127.0.0.1", "::1", "::ffff:127.0.0.1"];

/// Storage backend for the whitelist.
pub trait WhitelistStore: Send + Sync + fmt::Debug {
    fn contains(&self, address: &str) -> bool;
    /// Returns `true` if the address was not already present.
    fn insert(&self, address: &str) -> bool;
    /// Returns `true` if the address was present.
    fn remove(&self, address: &str) -> bool;
    fn snapshot(&self) -> BTreeSet<String>;
    /// Replaces the whole set.
    fn replace(&self, entries: BTreeSet<String>);
}

/// Concurrent in-process whitelist store.
#[derive(Debug, Default)]
pub struct InMemoryWhitelist {
    entries: DashSet<String>,
}

impl WhitelistStore for InMemoryWhitelist {
    fn contains(&self, address: &str) -> bool {
        self.entries.contains(address)
    }

    fn insert(&self, address: &str) -> bool {
        self.entries.insert(address.to_owned())
    }

    fn remove(&self, address: &str) -> bool {
        self.entries.remove(address).is_some()
    }

    fn snapshot(&self) -> BTreeSet<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    // Not atomic with respect to concurrent readers: a lookup racing a
    // replace may briefly observe a partially cleared set.
    fn replace(&self, entries: BTreeSet<String>) {
        self.entries.clear();
        entries.into_iter().for_each(|e| {
            self.entries.insert(e);
        });
    }
}

/// The whitelist as seen by the gate and the operator surface.
///
/// Cheap to clone; clones share the same store.
#[derive(Debug, Clone)]
pub struct WhitelistRegistry {
    store: Arc<dyn WhitelistStore>,
}

impl WhitelistRegistry {
    /// Creates a registry over `store`, seeding it with the loopback set
    /// plus the configured `seed` addresses.
    pub fn new(store: Arc<dyn WhitelistStore>, seed: &[String]) -> Self {
        let registry = Self { store };
        registry.reset();
        seed.iter().for_each(|address| {
            registry.store.insert(address);
        });
        registry
    }

    /// In-memory registry seeded with loopback and `seed`.
    pub fn in_memory(seed: &[String]) -> Self {
        Self::new(Arc::new(InMemoryWhitelist::default()), seed)
    }

    pub fn is_trusted(&self, address: &str) -> bool {
        self.store.contains(address)
    }

    pub fn add(&self, address: &str) {
        if self.store.insert(address) {
            info!(address, "address added to whitelist");
        }
    }

    pub fn remove(&self, address: &str) {
        if self.store.remove(address) {
            info!(address, "address removed from whitelist");
        }
    }

    pub fn list(&self) -> BTreeSet<String> {
        self.store.snapshot()
    }

    /// Restores exactly the loopback set, discarding every other entry
    /// including configuration seeds.
    pub fn reset(&self) {
        self.store.replace(
            LOOPBACK_ADDRESSES
                .iter()
                .map(|a| (*a).to_owned())
                .collect(),
        );
    }
}
