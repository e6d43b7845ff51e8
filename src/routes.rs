//! Per-route quota overrides.
//!
//! The gate asks a [`RouteMetadata`] provider whether the request being
//! evaluated targets a handler with its own quota. [`RouteTable`] answers
//! from an ordered list of regex rules compiled at startup; the first
//! matching rule wins.

use std::fmt;

use hyper::Method;
use regex::Regex;

use crate::quota::RouteOverride;

/// Capability query for route-specific quotas.
pub trait RouteMetadata: Send + Sync + fmt::Debug {
    fn override_for(&self, method: &Method, path: &str) -> Option<RouteOverride>;
}

/// A compiled override rule.
#[derive(Debug, Clone)]
pub struct RouteRule {
    /// Matched against the request path (no query string).
    pub pattern: Regex,
    /// `None` matches every method.
    pub method: Option<Method>,
    pub quota: RouteOverride,
}

impl RouteRule {
    fn matches(&self, method: &Method, path: &str) -> bool {
        self.method.as_ref().is_none_or(|m| m == method) && self.pattern.is_match(path)
    }
}

/// Ordered rule list; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl RouteMetadata for RouteTable {
    fn override_for(&self, method: &Method, path: &str) -> Option<RouteOverride> {
        self.rules
            .iter()
            .find(|rule| rule.matches(method, path))
            .map(|rule| rule.quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, method: Option<Method>, limit: u64) -> RouteRule {
        RouteRule {
            pattern: Regex::new(pattern).unwrap(),
            method,
            quota: RouteOverride {
                limit,
                ttl_ms: 60_000,
            },
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let table = RouteTable::new(vec![
            rule("^/auth/login$", Some(Method::POST), 5),
            rule("^/auth/", None, 20),
        ]);

        assert_eq!(
            table
                .override_for(&Method::POST, "/auth/login")
                .map(|o| o.limit),
            Some(5)
        );
        assert_eq!(
            table
                .override_for(&Method::GET, "/auth/login")
                .map(|o| o.limit),
            Some(20)
        );
    }

    #[test]
    fn unmatched_path_has_no_override() {
        let table = RouteTable::new(vec![rule("^/auth/", None, 20)]);
        assert_eq!(table.override_for(&Method::GET, "/readings"), None);
        assert!(RouteTable::default().is_empty());
    }
}
