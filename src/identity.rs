//! Client identity derivation.
//!
//! Every request is attributed to a raw address (used for whitelisting,
//! violations and blocks) and a tracker key (used for quota counting).
//! Anonymous trackers look like `ip-<address>`; authenticated ones are
//! salted with the user id as `user-<id>-<address>` so several users
//! behind one NAT never share a quota.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hyper::Request;
use hyper::header::HeaderMap;

use crate::config::IdentityConfig;
use crate::headers;

/// Placeholder address used when neither a forwarded-for header nor a
/// peer address is available.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// The authenticated caller, attached to the request extensions by the
/// authentication layer. Plan and admin flag are looked up by user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: u64,
}

/// The resolved identity of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    address: String,
    tracker: String,
}

impl ClientIdentity {
    /// Builds an identity from an already-resolved address and optional user id.
    pub fn new(address: impl Into<String>, user_id: Option<u64>) -> Self {
        let address = address.into();
        let tracker = match user_id {
            Some(id) => format!("user-{id}-{address}"),
            None => format!("ip-{address}"),
        };
        Self { address, tracker }
    }

    /// The raw client address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The counting key handed to the window counter.
    pub fn tracker(&self) -> &str {
        &self.tracker
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tracker)
    }
}

/// Derives [`ClientIdentity`] values from requests.
///
/// With no trusted proxies configured, `X-Forwarded-For` is honoured from
/// every peer. Otherwise only from the listed ones.
#[derive(Debug, Default, Clone)]
pub struct IdentityResolver {
    trusted_proxies: Arc<[IpAddr]>,
}

impl IdentityResolver {
    pub fn new(trusted_proxies: impl Into<Arc<[IpAddr]>>) -> Self {
        Self {
            trusted_proxies: trusted_proxies.into(),
        }
    }

    /// Resolves the identity of `req` received from `peer`.
    ///
    /// The address is the first `X-Forwarded-For` entry, falling back to
    /// the peer IP and then to [`UNKNOWN_ADDRESS`]. A [`Principal`] in the
    /// request extensions salts the tracker with its user id.
    pub fn resolve<B>(&self, req: &Request<B>, peer: Option<SocketAddr>) -> ClientIdentity {
        let address = self.address(req.headers(), peer);
        let user_id = req.extensions().get::<Principal>().map(|p| p.user_id);
        ClientIdentity::new(address, user_id)
    }

    /// Resolves only the raw address.
    pub fn address(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        let forwarded = self
            .honours_forwarded_for(peer)
            .then(|| headers::forwarded_client(headers))
            .flatten();

        forwarded
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_owned())
    }

    fn honours_forwarded_for(&self, peer: Option<SocketAddr>) -> bool {
        if self.trusted_proxies.is_empty() {
            return true;
        }
        peer.is_some_and(|p| self.trusted_proxies.contains(&p.ip()))
    }
}

/// Reads the principal that an upstream authentication layer placed in
/// the configured user id header.
///
/// Returns `None` unless the header holds a valid integer.
pub fn principal_from_headers(headers: &HeaderMap, config: &IdentityConfig) -> Option<Principal> {
    let user_id = headers
        .get(config.user_id.as_str())
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())?;

    Some(Principal { user_id })
}
