//! Client identity resolution.
//!
//! Derives a stable counter key for a request from its headers and, when
//! present, the identity attached by an upstream authentication step. The
//! resolver is a pure function of request metadata and performs no I/O.

use std::net::IpAddr;

use http::HeaderMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Header carrying an API key.
const API_KEY_HEADER: &str = "x-api-key";
/// Proxy-appended chain of client addresses, closest client first.
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Single client address set by a reverse proxy.
const REAL_IP_HEADER: &str = "x-real-ip";

/// Key used when no client address can be derived at all.
const UNKNOWN_CLIENT: &str = "unknown";

/// How a client was identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    /// Identified by network address only.
    Ip,
    /// Identified by a verified user account.
    User,
    /// Identified by an API key.
    ApiKey,
}

/// Subscription tier of the client, used to scale generic API ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    /// Unauthenticated traffic.
    Anonymous,
    /// Signed-in users on the free plan.
    Authenticated,
    /// Paying subscribers.
    Premium,
}

/// Identity attached to a request by the upstream authentication layer.
///
/// Tollgate does not verify credentials itself; it trusts whatever the
/// auth middleware placed in the request extensions.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Stable user identifier.
    pub user_id: String,
    /// The user's subscription plan.
    pub plan: PlanTier,
}

/// The resolved identity a request is counted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Stable counter key, prefixed by kind (`ip:`, `user:`, `key:`).
    pub key: String,
    /// How the client was identified.
    pub kind: ClientKind,
    /// Subscription tier used for ceiling adjustment.
    pub plan: PlanTier,
    /// Whether this client bypasses counting entirely.
    pub bypass: bool,
}

impl ClientIdentity {
    fn api_key(key: &str) -> Self {
        Self {
            key: format!("key:{key}"),
            kind: ClientKind::ApiKey,
            // API keys are issued to paid integrations.
            plan: PlanTier::Premium,
            bypass: false,
        }
    }

    fn user(auth: &AuthContext) -> Self {
        Self {
            key: format!("user:{}", auth.user_id),
            kind: ClientKind::User,
            plan: auth.plan,
            bypass: false,
        }
    }

    fn ip(addr: &str) -> Self {
        Self {
            key: format!("ip:{addr}"),
            kind: ClientKind::Ip,
            plan: PlanTier::Anonymous,
            bypass: false,
        }
    }

    /// Sentinel identity for allowlisted internal addresses.
    fn trusted(addr: &str) -> Self {
        Self {
            key: format!("ip:{addr}"),
            kind: ClientKind::Ip,
            plan: PlanTier::Anonymous,
            bypass: true,
        }
    }
}

/// Resolves request metadata into a [`ClientIdentity`].
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    /// CIDR blocks whose addresses bypass counting.
    trusted: Vec<IpNet>,
}

impl IdentityResolver {
    /// Create a resolver with the given trusted-address allowlist.
    pub fn new(trusted: Vec<IpNet>) -> Self {
        Self { trusted }
    }

    /// Resolve the identity for a request.
    ///
    /// Resolution order: a syntactically valid API key header, then the
    /// upstream auth identity, then the client network address. Malformed
    /// inputs fall through to the next step and never fail the request.
    pub fn resolve(&self, headers: &HeaderMap, auth: Option<&AuthContext>) -> ClientIdentity {
        if let Some(key) = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|k| is_valid_api_key(k))
        {
            return ClientIdentity::api_key(key);
        }

        if let Some(auth) = auth {
            return ClientIdentity::user(auth);
        }

        let addr = client_addr(headers);
        if let Ok(ip) = addr.parse::<IpAddr>() {
            if self.trusted.iter().any(|net| net.contains(&ip)) {
                return ClientIdentity::trusted(&addr);
            }
        }

        ClientIdentity::ip(&addr)
    }
}

/// Extract the client address from proxy headers.
///
/// Takes the first hop of `x-forwarded-for`, then `x-real-ip`, then the
/// literal `"unknown"`. IPv6 addresses are used verbatim apart from
/// whitespace trimming; an unparseable non-empty hop is still a stable
/// discriminator and is used as-is.
fn client_addr(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get(FORWARDED_FOR_HEADER).and_then(|v| v.to_str().ok()) {
        let first = forwarded.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }

    if let Some(real_ip) = headers.get(REAL_IP_HEADER).and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    UNKNOWN_CLIENT.to_string()
}

/// Syntactic check for API keys: non-empty, bounded length, and limited to
/// ASCII alphanumerics plus `-`, `_` and `.`.
fn is_valid_api_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 128
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
