//! Rate limit decision engine.
//!
//! Combines the resolved identity, the matched policy and the counter
//! store outcome into an allow/deny decision plus the values surfaced in
//! rate limit response headers.

use dashmap::DashMap;
use metrics::counter;
use tracing::warn;

use crate::ratelimit::identity::{ClientIdentity, PlanTier};
use crate::ratelimit::policy::{RateLimitPolicy, UNLIMITED};
use crate::store::StoreStatus;

/// Cap on the retry-after escalation: at most 2^3 = 8x the base interval.
const MAX_ESCALATION_SHIFT: u32 = 3;

/// A violation streak is forgotten after this much quiet time.
const VIOLATION_TTL_SECS: u64 = 3600;

/// Streak map size that triggers a prune of stale violators.
const MAX_TRACKED_VIOLATORS: usize = 10_000;

/// The per-request outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// The effective ceiling applied to this request.
    pub limit: u64,
    /// Requests left in the current window.
    pub remaining: u64,
    /// Epoch second at which the window resets.
    pub reset_at: u64,
    /// Seconds the client should wait before retrying; denials only.
    pub retry_after: Option<u64>,
    /// Whether the counter store was unavailable for this decision.
    pub degraded: bool,
    /// Whether the request bypassed counting entirely.
    pub bypass: bool,
}

struct ViolationStreak {
    denials: u32,
    last_denial: u64,
}

/// Produces [`RateLimitDecision`]s and tracks per-client violation
/// streaks for retry-after escalation.
///
/// Streaks are process-local, reset by any allowed decision, and expire
/// after a quiet hour; escalation is a best-effort per-node signal.
pub struct DecisionEngine {
    violations: DashMap<String, ViolationStreak>,
}

impl DecisionEngine {
    /// Create a new decision engine.
    pub fn new() -> Self {
        Self {
            violations: DashMap::new(),
        }
    }

    /// Decide whether a request is allowed.
    ///
    /// Bypass identities and unlimited classes are allowed without
    /// consulting the counter. A store outage is an explicit branch: the
    /// policy's `fail_open` flag decides, and the degradation is marked
    /// on the decision rather than surfaced as an error.
    pub fn decide(
        &self,
        identity: &ClientIdentity,
        policy: &RateLimitPolicy,
        status: StoreStatus,
        now: u64,
    ) -> RateLimitDecision {
        if identity.bypass || policy.class.is_unlimited() {
            self.record(policy, "bypass");
            return RateLimitDecision {
                allowed: true,
                limit: UNLIMITED,
                remaining: UNLIMITED,
                reset_at: now,
                retry_after: None,
                degraded: false,
                bypass: true,
            };
        }

        let ceiling = effective_ceiling(policy, identity.plan);

        match status {
            StoreStatus::Counted(snapshot) => {
                // The request that reaches the ceiling exactly is still
                // allowed; the next one is denied.
                let allowed = snapshot.count <= ceiling;
                let remaining = ceiling.saturating_sub(snapshot.count);

                if allowed {
                    self.violations.remove(&identity.key);
                    self.record(policy, "allowed");
                    RateLimitDecision {
                        allowed: true,
                        limit: ceiling,
                        remaining,
                        reset_at: snapshot.expires_at,
                        retry_after: None,
                        degraded: false,
                        bypass: false,
                    }
                } else {
                    let streak = self.bump_violations(&identity.key, now);
                    let base = snapshot.expires_at.saturating_sub(now).max(1);
                    let shift = streak.saturating_sub(1).min(MAX_ESCALATION_SHIFT);
                    let retry_after = base.saturating_mul(1 << shift);

                    warn!(
                        client = %identity.key,
                        class = %policy.class,
                        count = snapshot.count,
                        limit = ceiling,
                        "rate limit exceeded"
                    );
                    self.record(policy, "limited");

                    RateLimitDecision {
                        allowed: false,
                        limit: ceiling,
                        remaining: 0,
                        reset_at: snapshot.expires_at,
                        retry_after: Some(retry_after),
                        degraded: false,
                        bypass: false,
                    }
                }
            }
            StoreStatus::Skipped => {
                self.record(policy, "bypass");
                RateLimitDecision {
                    allowed: true,
                    limit: ceiling,
                    remaining: ceiling,
                    reset_at: now,
                    retry_after: None,
                    degraded: false,
                    bypass: true,
                }
            }
            StoreStatus::Unavailable => {
                self.record(policy, "degraded");
                RateLimitDecision {
                    allowed: policy.fail_open,
                    limit: ceiling,
                    remaining: ceiling,
                    reset_at: now + policy.window.as_secs(),
                    retry_after: if policy.fail_open {
                        None
                    } else {
                        Some(policy.window.as_secs())
                    },
                    degraded: true,
                    bypass: false,
                }
            }
        }
    }

    fn record(&self, policy: &RateLimitPolicy, status: &'static str) {
        counter!(
            "rate_limit_requests_total",
            "status" => status,
            "class" => policy.class.as_str()
        )
        .increment(1);
    }

    fn bump_violations(&self, key: &str, now: u64) -> u32 {
        // Bound the streak map: stale violators are dropped once the map
        // grows past a threshold, instead of on a timer.
        if self.violations.len() > MAX_TRACKED_VIOLATORS {
            self.violations
                .retain(|_, streak| now.saturating_sub(streak.last_denial) <= VIOLATION_TTL_SECS);
        }

        let mut entry = self
            .violations
            .entry(key.to_string())
            .or_insert(ViolationStreak {
                denials: 0,
                last_denial: now,
            });
        if now.saturating_sub(entry.last_denial) > VIOLATION_TTL_SECS {
            entry.denials = 0;
        }
        entry.denials += 1;
        entry.last_denial = now;
        entry.denials
    }

    /// Number of clients with a live violation streak.
    pub fn tracked_violators(&self) -> usize {
        self.violations.len()
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// The ceiling after plan adjustment.
///
/// Only the generic API class scales with the plan tier; auth, AI and
/// admin ceilings are fixed.
fn effective_ceiling(policy: &RateLimitPolicy, plan: PlanTier) -> u64 {
    if !policy.class.plan_adjusted() {
        return policy.max_requests;
    }
    let factor = match plan {
        PlanTier::Anonymous => 1,
        PlanTier::Authenticated => 2,
        PlanTier::Premium => 10,
    };
    policy.max_requests.saturating_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::identity::ClientKind;
    use crate::ratelimit::policy::RouteClass;
    use crate::store::WindowSnapshot;
    use std::time::Duration;

    fn identity(plan: PlanTier) -> ClientIdentity {
        ClientIdentity {
            key: "ip:203.0.113.9".to_string(),
            kind: ClientKind::Ip,
            plan,
            bypass: false,
        }
    }

    fn api_policy() -> RateLimitPolicy {
        RateLimitPolicy::new(RouteClass::Api, Duration::from_secs(60), 100)
    }

    fn counted(count: u64) -> StoreStatus {
        StoreStatus::Counted(WindowSnapshot {
            count,
            expires_at: 180,
        })
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let engine = DecisionEngine::new();
        let identity = identity(PlanTier::Anonymous);
        let policy = api_policy();

        // The 100th request hits the ceiling exactly and is allowed.
        let decision = engine.decide(&identity, &policy, counted(100), 120);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);

        // The 101st is denied.
        let decision = engine.decide(&identity, &policy, counted(101), 120);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.retry_after.unwrap() > 0);
    }

    #[test]
    fn test_remaining_counts_down() {
        let engine = DecisionEngine::new();
        let identity = identity(PlanTier::Anonymous);
        let policy = api_policy();

        let decision = engine.decide(&identity, &policy, counted(1), 120);
        assert_eq!(decision.remaining, 99);

        let decision = engine.decide(&identity, &policy, counted(60), 120);
        assert_eq!(decision.remaining, 40);
    }

    #[test]
    fn test_plan_tier_scales_api_ceiling() {
        let engine = DecisionEngine::new();
        let policy = api_policy();

        let decision = engine.decide(&identity(PlanTier::Anonymous), &policy, counted(1), 120);
        assert_eq!(decision.limit, 100);

        let decision = engine.decide(&identity(PlanTier::Authenticated), &policy, counted(1), 120);
        assert_eq!(decision.limit, 200);

        let decision = engine.decide(&identity(PlanTier::Premium), &policy, counted(1), 120);
        assert_eq!(decision.limit, 1000);
    }

    #[test]
    fn test_auth_ceiling_is_not_plan_adjusted() {
        let engine = DecisionEngine::new();
        let policy = RateLimitPolicy::new(RouteClass::Auth, Duration::from_secs(900), 5);

        let decision = engine.decide(&identity(PlanTier::Premium), &policy, counted(6), 120);
        assert!(!decision.allowed);
        assert_eq!(decision.limit, 5);
    }

    #[test]
    fn test_bypass_identity_is_always_allowed() {
        let engine = DecisionEngine::new();
        let mut identity = identity(PlanTier::Anonymous);
        identity.bypass = true;
        let policy = api_policy();

        let decision = engine.decide(&identity, &policy, StoreStatus::Skipped, 120);
        assert!(decision.allowed);
        assert!(decision.bypass);
        assert_eq!(decision.limit, UNLIMITED);
    }

    #[test]
    fn test_health_class_is_always_allowed() {
        let engine = DecisionEngine::new();
        let identity = identity(PlanTier::Anonymous);
        let policy = RateLimitPolicy::unlimited(RouteClass::Health);

        let decision = engine.decide(&identity, &policy, StoreStatus::Skipped, 120);
        assert!(decision.allowed);
        assert!(decision.bypass);
    }

    #[test]
    fn test_store_outage_fails_open() {
        let engine = DecisionEngine::new();
        let identity = identity(PlanTier::Anonymous);
        let policy = api_policy();

        let decision = engine.decide(&identity, &policy, StoreStatus::Unavailable, 120);
        assert!(decision.allowed);
        assert!(decision.degraded);
        assert!(decision.retry_after.is_none());
    }

    #[test]
    fn test_fail_closed_policy_denies_on_outage() {
        let engine = DecisionEngine::new();
        let identity = identity(PlanTier::Anonymous);
        let mut policy = api_policy();
        policy.fail_open = false;

        let decision = engine.decide(&identity, &policy, StoreStatus::Unavailable, 120);
        assert!(!decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.retry_after, Some(60));
    }

    #[test]
    fn test_retry_after_escalates_for_repeat_violators() {
        let engine = DecisionEngine::new();
        let identity = identity(PlanTier::Anonymous);
        let policy = api_policy();

        // Window expires at 180, now is 120: base interval is 60s.
        let first = engine.decide(&identity, &policy, counted(101), 120);
        assert_eq!(first.retry_after, Some(60));

        let second = engine.decide(&identity, &policy, counted(102), 120);
        assert_eq!(second.retry_after, Some(120));

        let third = engine.decide(&identity, &policy, counted(103), 120);
        assert_eq!(third.retry_after, Some(240));

        // Escalation is capped at 8x.
        for count in 104..110 {
            let decision = engine.decide(&identity, &policy, counted(count), 120);
            assert!(decision.retry_after.unwrap() <= 60 * 8);
        }
    }

    #[test]
    fn test_allowed_decision_resets_streak() {
        let engine = DecisionEngine::new();
        let identity = identity(PlanTier::Anonymous);
        let policy = api_policy();

        engine.decide(&identity, &policy, counted(101), 120);
        engine.decide(&identity, &policy, counted(102), 120);
        assert_eq!(engine.tracked_violators(), 1);

        // A fresh window lets a request through and clears the streak.
        engine.decide(&identity, &policy, counted(1), 200);
        assert_eq!(engine.tracked_violators(), 0);

        let decision = engine.decide(&identity, &policy, counted(101), 220);
        assert_eq!(decision.retry_after, Some(1));
    }

    #[test]
    fn test_retry_after_has_a_floor() {
        let engine = DecisionEngine::new();
        let identity = identity(PlanTier::Anonymous);
        let policy = api_policy();

        // Window already at its end: base clamps to 1 second.
        let decision = engine.decide(
            &identity,
            &policy,
            StoreStatus::Counted(WindowSnapshot {
                count: 101,
                expires_at: 120,
            }),
            120,
        );
        assert_eq!(decision.retry_after, Some(1));
    }
}
