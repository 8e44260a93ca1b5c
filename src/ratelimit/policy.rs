//! Rate limit policy configuration and path matching.
//!
//! This module defines the closed set of route classes, the per-class
//! default policies, and the ordered prefix table that maps a request
//! path to the single applicable policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Sentinel ceiling for classes that are never counted.
pub const UNLIMITED: u64 = u64::MAX;

/// Coarse category of endpoint used to select a rate limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteClass {
    /// Health and readiness probes, never counted.
    Health,
    /// Non-API paths, never counted.
    Public,
    /// Generic API endpoints.
    Api,
    /// Login, registration and credential endpoints.
    Auth,
    /// Model inference endpoints.
    Ai,
    /// Administrative endpoints.
    Admin,
}

impl RouteClass {
    /// Whether requests in this class bypass counting entirely.
    pub fn is_unlimited(&self) -> bool {
        matches!(self, RouteClass::Health | RouteClass::Public)
    }

    /// Whether the ceiling for this class is adjusted by plan tier.
    ///
    /// Only the generic API class scales with the client's plan; auth, AI
    /// and admin ceilings are fixed regardless of tier.
    pub fn plan_adjusted(&self) -> bool {
        matches!(self, RouteClass::Api)
    }

    /// The error message returned in a 429 body for this class.
    pub fn deny_message(&self) -> &'static str {
        match self {
            RouteClass::Auth => "too many authentication attempts, please try again later",
            RouteClass::Ai => "AI request limit reached, please slow down",
            RouteClass::Admin => "admin request limit reached",
            _ => "rate limit exceeded, please try again later",
        }
    }

    /// Stable lowercase name, used in counter keys and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Health => "health",
            RouteClass::Public => "public",
            RouteClass::Api => "api",
            RouteClass::Auth => "auth",
            RouteClass::Ai => "ai",
            RouteClass::Admin => "admin",
        }
    }

    /// The built-in policy values for this class.
    fn default_policy(&self) -> RateLimitPolicy {
        match self {
            RouteClass::Health | RouteClass::Public => RateLimitPolicy::unlimited(*self),
            RouteClass::Auth => RateLimitPolicy::new(*self, Duration::from_secs(900), 5),
            RouteClass::Ai => RateLimitPolicy::new(*self, Duration::from_secs(60), 10),
            RouteClass::Admin => RateLimitPolicy::new(*self, Duration::from_secs(60), 2),
            RouteClass::Api => RateLimitPolicy::new(*self, Duration::from_secs(60), 100),
        }
    }
}

impl std::fmt::Display for RouteClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rate limit policy for one route class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// The route class this policy applies to.
    pub class: RouteClass,
    /// Length of the counting window.
    pub window: Duration,
    /// Maximum requests allowed per window, before plan adjustment.
    pub max_requests: u64,
    /// Whether to allow requests when the counter store is unavailable.
    pub fail_open: bool,
}

impl RateLimitPolicy {
    /// Create a counted policy with the default fail-open behavior.
    pub fn new(class: RouteClass, window: Duration, max_requests: u64) -> Self {
        Self {
            class,
            window,
            max_requests,
            fail_open: true,
        }
    }

    /// Create the unlimited sentinel policy for a bypassed class.
    pub fn unlimited(class: RouteClass) -> Self {
        Self {
            class,
            window: Duration::from_secs(60),
            max_requests: UNLIMITED,
            fail_open: true,
        }
    }

    /// Whether this policy is the unlimited sentinel.
    pub fn is_unlimited(&self) -> bool {
        self.max_requests == UNLIMITED
    }
}

/// A configured policy rule, as it appears in the configuration file.
///
/// Omitted window/ceiling values fall back to the class defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Path prefix this rule applies to.
    pub prefix: String,
    /// The route class for matching requests.
    pub class: RouteClass,
    /// Window length in seconds.
    #[serde(default)]
    pub window_secs: Option<u64>,
    /// Maximum requests per window.
    #[serde(default)]
    pub max_requests: Option<u64>,
    /// Whether to allow requests when the counter store is unavailable.
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
}

fn default_fail_open() -> bool {
    true
}

/// The static, ordered table mapping path prefixes to policies.
///
/// Matching is longest-prefix-wins and deterministic: the same path always
/// resolves to the same policy. The table always contains a `/` catch-all,
/// so every path matches exactly one rule.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    /// Rules sorted by descending prefix length.
    rules: Vec<(String, RateLimitPolicy)>,
}

impl PolicyTable {
    /// Build the default policy table.
    pub fn with_defaults() -> Self {
        let rules = vec![
            ("/health".to_string(), RouteClass::Health.default_policy()),
            ("/ready".to_string(), RouteClass::Health.default_policy()),
            ("/api/auth/".to_string(), RouteClass::Auth.default_policy()),
            ("/api/ai/".to_string(), RouteClass::Ai.default_policy()),
            ("/api/admin/".to_string(), RouteClass::Admin.default_policy()),
            ("/api/".to_string(), RouteClass::Api.default_policy()),
            ("/".to_string(), RouteClass::Public.default_policy()),
        ];
        Self::from_sorted(rules)
    }

    /// Build a table from configured rules, validating eagerly.
    ///
    /// Invalid rules are a startup error: a countable class must have a
    /// positive window and ceiling, and prefixes must be unique. A `/`
    /// catch-all is appended if the configuration does not provide one.
    pub fn from_rules(rules: &[PolicyRule]) -> Result<Self> {
        let mut table = Vec::with_capacity(rules.len() + 1);

        for rule in rules {
            if rule.prefix.is_empty() || !rule.prefix.starts_with('/') {
                return Err(TollgateError::Config(format!(
                    "policy prefix must start with '/': {:?}",
                    rule.prefix
                )));
            }
            if table.iter().any(|(p, _)| p == &rule.prefix) {
                return Err(TollgateError::Config(format!(
                    "duplicate policy prefix: {}",
                    rule.prefix
                )));
            }

            let defaults = rule.class.default_policy();
            let policy = if rule.class.is_unlimited() {
                RateLimitPolicy::unlimited(rule.class)
            } else {
                let window_secs = rule.window_secs.unwrap_or(defaults.window.as_secs());
                let max_requests = rule.max_requests.unwrap_or(defaults.max_requests);
                if window_secs == 0 || max_requests == 0 {
                    return Err(TollgateError::Config(format!(
                        "policy for prefix {} must have a positive window and ceiling",
                        rule.prefix
                    )));
                }
                RateLimitPolicy {
                    class: rule.class,
                    window: Duration::from_secs(window_secs),
                    max_requests,
                    fail_open: rule.fail_open,
                }
            };

            table.push((rule.prefix.clone(), policy));
        }

        if !table.iter().any(|(p, _)| p == "/") {
            table.push(("/".to_string(), RouteClass::Public.default_policy()));
        }

        Ok(Self::from_sorted(table))
    }

    fn from_sorted(mut rules: Vec<(String, RateLimitPolicy)>) -> Self {
        rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { rules }
    }

    /// Resolve the single applicable policy for a request path.
    pub fn resolve(&self, path: &str) -> &RateLimitPolicy {
        self.rules
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, policy)| policy)
            // The `/` catch-all matches every path.
            .unwrap_or(&self.rules[self.rules.len() - 1].1)
    }

    /// Multiply every countable ceiling by `factor`.
    ///
    /// Used to relax limits in non-production environments.
    pub fn relax(&mut self, factor: u64) {
        for (_, policy) in &mut self.rules {
            if !policy.is_unlimited() {
                policy.max_requests = policy.max_requests.saturating_mul(factor);
            }
        }
    }

    /// Number of rules in the table.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table contains no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_resolves_classes() {
        let table = PolicyTable::with_defaults();

        assert_eq!(table.resolve("/health").class, RouteClass::Health);
        assert_eq!(table.resolve("/ready").class, RouteClass::Health);
        assert_eq!(table.resolve("/api/auth/login").class, RouteClass::Auth);
        assert_eq!(table.resolve("/api/ai/generate").class, RouteClass::Ai);
        assert_eq!(table.resolve("/api/admin/users").class, RouteClass::Admin);
        assert_eq!(table.resolve("/api/v1/test").class, RouteClass::Api);
        assert_eq!(table.resolve("/about").class, RouteClass::Public);
        assert_eq!(table.resolve("/").class, RouteClass::Public);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = PolicyTable::with_defaults();

        // /api/auth/ is more specific than /api/
        let policy = table.resolve("/api/auth/login");
        assert_eq!(policy.class, RouteClass::Auth);
        assert_eq!(policy.max_requests, 5);

        let policy = table.resolve("/api/portfolios");
        assert_eq!(policy.class, RouteClass::Api);
        assert_eq!(policy.max_requests, 100);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let table = PolicyTable::with_defaults();
        let first = table.resolve("/api/v1/test").clone();

        for _ in 0..10 {
            assert_eq!(*table.resolve("/api/v1/test"), first);
        }
    }

    #[test]
    fn test_default_ceilings() {
        let table = PolicyTable::with_defaults();

        assert_eq!(table.resolve("/api/auth/login").max_requests, 5);
        assert_eq!(table.resolve("/api/ai/bio").max_requests, 10);
        assert_eq!(table.resolve("/api/admin/x").max_requests, 2);
        assert_eq!(table.resolve("/api/x").max_requests, 100);
        assert!(table.resolve("/health").is_unlimited());
        assert!(table.resolve("/static/app.js").is_unlimited());
    }

    #[test]
    fn test_unlimited_classes_bypass() {
        assert!(RouteClass::Health.is_unlimited());
        assert!(RouteClass::Public.is_unlimited());
        assert!(!RouteClass::Api.is_unlimited());
        assert!(!RouteClass::Auth.is_unlimited());
    }

    #[test]
    fn test_from_rules_with_overrides() {
        let rules = vec![PolicyRule {
            prefix: "/api/".to_string(),
            class: RouteClass::Api,
            window_secs: Some(30),
            max_requests: Some(50),
            fail_open: true,
        }];

        let table = PolicyTable::from_rules(&rules).unwrap();
        let policy = table.resolve("/api/x");
        assert_eq!(policy.window, Duration::from_secs(30));
        assert_eq!(policy.max_requests, 50);

        // Catch-all is appended automatically.
        assert_eq!(table.resolve("/other").class, RouteClass::Public);
    }

    #[test]
    fn test_from_rules_rejects_zero_window() {
        let rules = vec![PolicyRule {
            prefix: "/api/".to_string(),
            class: RouteClass::Api,
            window_secs: Some(0),
            max_requests: Some(50),
            fail_open: true,
        }];

        assert!(PolicyTable::from_rules(&rules).is_err());
    }

    #[test]
    fn test_from_rules_rejects_zero_ceiling() {
        let rules = vec![PolicyRule {
            prefix: "/api/".to_string(),
            class: RouteClass::Api,
            window_secs: Some(60),
            max_requests: Some(0),
            fail_open: true,
        }];

        assert!(PolicyTable::from_rules(&rules).is_err());
    }

    #[test]
    fn test_from_rules_rejects_duplicate_prefix() {
        let rules = vec![
            PolicyRule {
                prefix: "/api/".to_string(),
                class: RouteClass::Api,
                window_secs: None,
                max_requests: None,
                fail_open: true,
            },
            PolicyRule {
                prefix: "/api/".to_string(),
                class: RouteClass::Ai,
                window_secs: None,
                max_requests: None,
                fail_open: true,
            },
        ];

        assert!(PolicyTable::from_rules(&rules).is_err());
    }

    #[test]
    fn test_relax_multiplies_countable_ceilings() {
        let mut table = PolicyTable::with_defaults();
        table.relax(10);

        assert_eq!(table.resolve("/api/x").max_requests, 1000);
        assert_eq!(table.resolve("/api/auth/login").max_requests, 50);
        // Unlimited sentinels are untouched.
        assert!(table.resolve("/health").is_unlimited());
    }

    #[test]
    fn test_class_serde_names() {
        let class: RouteClass = serde_yaml::from_str("ai").unwrap();
        assert_eq!(class, RouteClass::Ai);
        assert_eq!(RouteClass::Admin.to_string(), "admin");
    }
}
