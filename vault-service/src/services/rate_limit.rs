//! Per-actor, per-operation-class rate limiting.

use governor::{
    clock::{Clock, DefaultClock},
    middleware::StateInformationMiddleware,
    state::keyed::DashMapStateStore,
    RateLimiter,
};
use metrics::counter;
use service_core::middleware::rate_limit::quota;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::error::ServiceError;
use crate::config::{ClassLimit, RateLimitConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    SecretRead,
    SecretWrite,
    History,
    Audit,
    Membership,
    Invite,
    Org,
}

impl OperationClass {
    pub const ALL: [OperationClass; 7] = [
        OperationClass::SecretRead,
        OperationClass::SecretWrite,
        OperationClass::History,
        OperationClass::Audit,
        OperationClass::Membership,
        OperationClass::Invite,
        OperationClass::Org,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::SecretRead => "secret_read",
            OperationClass::SecretWrite => "secret_write",
            OperationClass::History => "history",
            OperationClass::Audit => "audit",
            OperationClass::Membership => "membership",
            OperationClass::Invite => "invite",
            OperationClass::Org => "org",
        }
    }

    fn limit(&self, config: &RateLimitConfig) -> ClassLimit {
        match self {
            OperationClass::SecretRead => config.secret_read,
            OperationClass::SecretWrite => config.secret_write,
            OperationClass::History => config.history,
            OperationClass::Audit => config.audit,
            OperationClass::Membership => config.membership,
            OperationClass::Invite => config.invite,
            OperationClass::Org => config.org,
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type ActorLimiter =
    RateLimiter<Uuid, DashMapStateStore<Uuid>, DefaultClock, StateInformationMiddleware>;

#[derive(Clone)]
pub struct ActorRateLimiter {
    limiters: Arc<HashMap<OperationClass, ActorLimiter>>,
}

impl ActorRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let limiters = OperationClass::ALL
            .iter()
            .map(|class| {
                let limit = class.limit(config);
                let limiter = RateLimiter::dashmap(quota(limit.requests, limit.window_seconds))
                    .with_middleware::<StateInformationMiddleware>();
                (*class, limiter)
            })
            .collect();

        Self {
            limiters: Arc::new(limiters),
        }
    }

    /// Consume one unit of `actor`'s quota for `class`, returning what is left.
    pub fn check(&self, actor: Uuid, class: OperationClass) -> Result<u32, ServiceError> {
        let Some(limiter) = self.limiters.get(&class) else {
            return Ok(u32::MAX);
        };

        match limiter.check_key(&actor) {
            Ok(snapshot) => Ok(snapshot.remaining_burst_capacity()),
            Err(negative) => {
                let wait = negative.wait_time_from(DefaultClock::default().now());
                warn!(user_id = %actor, class = %class, retry_after_ms = wait.as_millis() as u64, "Rate limit exceeded");
                counter!("vault_throttled_total", "class" => class.as_str()).increment(1);
                Err(ServiceError::Throttled {
                    class: class.as_str(),
                    remaining: 0,
                    retry_after_secs: wait.as_secs().max(1),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight(class_limit: ClassLimit) -> ActorRateLimiter {
        ActorRateLimiter::new(&RateLimitConfig {
            audit: class_limit,
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn exhausting_a_class_throttles_with_retry_after() {
        let limiter = tight(ClassLimit::new(2, 3600));
        let actor = Uuid::new_v4();

        assert_eq!(limiter.check(actor, OperationClass::Audit).unwrap(), 1);
        assert_eq!(limiter.check(actor, OperationClass::Audit).unwrap(), 0);

        match limiter.check(actor, OperationClass::Audit) {
            Err(ServiceError::Throttled {
                class,
                remaining,
                retry_after_secs,
            }) => {
                assert_eq!(class, "audit");
                assert_eq!(remaining, 0);
                assert!(retry_after_secs >= 1);
            }
            other => panic!("expected throttling, got {other:?}"),
        }
    }

    #[test]
    fn classes_and_actors_are_independent() {
        let limiter = tight(ClassLimit::new(1, 3600));
        let actor = Uuid::new_v4();

        assert!(limiter.check(actor, OperationClass::Audit).is_ok());
        assert!(limiter.check(actor, OperationClass::Audit).is_err());
        assert!(limiter.check(actor, OperationClass::SecretRead).is_ok());
        assert!(limiter.check(Uuid::new_v4(), OperationClass::Audit).is_ok());
    }
}
