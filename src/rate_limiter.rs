//! Token bucket rate limiting (§4.4): refill is computed lazily from elapsed
//! wall-clock time rather than a background ticker, so buckets stay correct
//! across restarts and idle periods.

use crate::store::rate_limiter::BucketRow;
use crate::store::rules::RateLimitSpec;
use crate::store::Store;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub tokens_remaining: f64,
    pub retry_after_seconds: Option<u64>,
}

pub struct RateLimiter {
    store: Arc<Store>,
}

impl RateLimiter {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Reads the bucket (or synthesizes a full one on first use), refills
    /// it for elapsed time, then attempts to withdraw one token.
    pub async fn check_and_consume(
        &self,
        rule_id: &str,
        tool: &str,
        host: &str,
        agent: &str,
        spec: &RateLimitSpec,
        now_ms: i64,
    ) -> Result<RateLimitDecision, crate::error::StoreError> {
        let existing = self.store.get_bucket(rule_id, tool, host, agent).await?;

        let (mut tokens, last_refill) = match existing {
            Some(row) => (row.tokens, row.last_refill),
            None => (spec.max_tokens, now_ms),
        };

        let elapsed_seconds = ((now_ms - last_refill).max(0) as f64) / 1_000.0;
        tokens = (tokens + elapsed_seconds * spec.refill_rate_per_sec).min(spec.max_tokens);

        let allowed = tokens >= 1.0;
        if allowed {
            tokens -= 1.0;
        }

        self.store
            .put_bucket(
                &BucketRow {
                    rule_id: rule_id.to_string(),
                    tool: tool.to_string(),
                    host: host.to_string(),
                    agent: agent.to_string(),
                    tokens,
                    last_refill: now_ms,
                },
                now_ms,
            )
            .await?;

        let retry_after_seconds = if allowed {
            None
        } else {
            let deficit = 1.0 - tokens;
            let seconds = if spec.refill_rate_per_sec > 0.0 {
                (deficit / spec.refill_rate_per_sec).ceil() as u64
            } else {
                spec.window_seconds
            };
            Some(seconds.max(1))
        };

        Ok(RateLimitDecision {
            allowed,
            tokens_remaining: tokens,
            retry_after_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RateLimitSpec {
        RateLimitSpec {
            max_tokens: 3.0,
            window_seconds: 60,
            refill_rate_per_sec: 1.0 / 60.0,
        }
    }

    #[tokio::test]
    async fn first_calls_consume_from_a_full_bucket() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let limiter = RateLimiter::new(store);
        let spec = spec();

        for _ in 0..3 {
            let d = limiter
                .check_and_consume("r1", "tool", "host", "agent", &spec, 0)
                .await
                .unwrap();
            assert!(d.allowed);
        }
        let exhausted = limiter
            .check_and_consume("r1", "tool", "host", "agent", &spec, 0)
            .await
            .unwrap();
        assert!(!exhausted.allowed);
        assert!(exhausted.retry_after_seconds.is_some());
    }

    #[tokio::test]
    async fn tokens_refill_over_elapsed_time() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let limiter = RateLimiter::new(store);
        let spec = RateLimitSpec {
            max_tokens: 1.0,
            window_seconds: 10,
            refill_rate_per_sec: 1.0,
        };

        let first = limiter
            .check_and_consume("r1", "t", "h", "a", &spec, 0)
            .await
            .unwrap();
        assert!(first.allowed);

        let too_soon = limiter
            .check_and_consume("r1", "t", "h", "a", &spec, 500)
            .await
            .unwrap();
        assert!(!too_soon.allowed);

        let after_refill = limiter
            .check_and_consume("r1", "t", "h", "a", &spec, 1_500)
            .await
            .unwrap();
        assert!(after_refill.allowed);
    }

    #[tokio::test]
    async fn distinct_rule_tool_host_agent_tuples_are_independent() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let limiter = RateLimiter::new(store);
        let spec = RateLimitSpec {
            max_tokens: 1.0,
            window_seconds: 60,
            refill_rate_per_sec: 0.0,
        };

        let a = limiter
            .check_and_consume("r1", "t", "h", "agent-a", &spec, 0)
            .await
            .unwrap();
        let b = limiter
            .check_and_consume("r1", "t", "h", "agent-b", &spec, 0)
            .await
            .unwrap();
        assert!(a.allowed);
        assert!(b.allowed);
    }
}
