//! Per-host circuit breaker FSM (§4.3).
//!
//! ```text
//! closed --(failure_count >= threshold)--> open
//! open   --(now >= opened_at + cooldown)--> half-open
//! half-open --(success)--> closed
//! half-open --(failure)--> open
//! ```
//! A half-open probe is a single in-flight call; callers must not admit a
//! second concurrent probe while one is outstanding.

use crate::store::circuit_breaker::CircuitBreakerState;
use crate::store::Store;
use crate::types::CircuitState;
use std::sync::Arc;

pub const DEFAULT_FAILURE_THRESHOLD: i64 = 2;
pub const DEFAULT_COOLDOWN_SECONDS: i64 = 120;

pub struct CircuitBreakerConfig {
    pub failure_threshold: i64,
    pub cooldown_seconds: i64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_seconds: DEFAULT_COOLDOWN_SECONDS,
        }
    }
}

pub struct CircuitBreaker {
    store: Arc<Store>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<Store>, config: CircuitBreakerConfig) -> Self {
        Self { store, config }
    }

    /// Evaluates whether `host` currently admits traffic. A half-open
    /// transition is applied (and persisted) as a side effect of the read,
    /// since reaching cooldown is itself a state change.
    pub async fn admit(&self, host: &str, now_ms: i64) -> Result<bool, crate::error::StoreError> {
        let mut cb = self.store.get_circuit_breaker(host).await?;

        if cb.state == CircuitState::Open {
            let cooldown_elapsed = cb
                .opened_at
                .map(|opened| now_ms >= opened + self.config.cooldown_seconds * 1_000)
                .unwrap_or(false);
            if cooldown_elapsed {
                cb.state = CircuitState::HalfOpen;
                cb.half_open_at = Some(now_ms);
                self.store.put_circuit_breaker(&cb).await?;
            }
        }

        Ok(cb.state != CircuitState::Open)
    }

    pub async fn record_success(&self, host: &str, now_ms: i64) -> Result<(), crate::error::StoreError> {
        let mut cb = self.store.get_circuit_breaker(host).await?;
        cb.state = CircuitState::Closed;
        cb.failure_count = 0;
        cb.last_success = Some(now_ms);
        cb.opened_at = None;
        cb.half_open_at = None;
        self.store.put_circuit_breaker(&cb).await
    }

    /// Records a failure. From `closed`, opens once `failure_threshold` is
    /// reached; from `half-open`, a single failure reopens immediately.
    pub async fn record_failure(&self, host: &str, now_ms: i64) -> Result<CircuitState, crate::error::StoreError> {
        let mut cb = self.store.get_circuit_breaker(host).await?;
        cb.last_failure = Some(now_ms);

        match cb.state {
            CircuitState::HalfOpen => {
                cb.state = CircuitState::Open;
                cb.opened_at = Some(now_ms);
                cb.half_open_at = None;
            }
            CircuitState::Closed | CircuitState::Open => {
                cb.failure_count += 1;
                if cb.failure_count >= self.config.failure_threshold {
                    cb.state = CircuitState::Open;
                    cb.opened_at = Some(now_ms);
                }
            }
        }

        self.store.put_circuit_breaker(&cb).await?;
        Ok(cb.state)
    }

    pub async fn state(&self, host: &str) -> Result<CircuitBreakerState, crate::error::StoreError> {
        self.store.get_circuit_breaker(host).await
    }

    /// Convenience wrapper so callers don't have to branch on success vs.
    /// failure at the call site.
    pub async fn record_outcome(&self, host: &str, is_error: bool, now_ms: i64) -> Result<(), crate::error::StoreError> {
        if is_error {
            self.record_failure(host, now_ms).await.map(|_| ())
        } else {
            self.record_success(host, now_ms).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(store: Arc<Store>) -> CircuitBreaker {
        CircuitBreaker::new(store, CircuitBreakerConfig::default())
    }

    #[tokio::test]
    async fn closed_host_admits_traffic() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cb = breaker(store);
        assert!(cb.admit("host-a", 0).await.unwrap());
    }

    #[tokio::test]
    async fn opens_after_reaching_failure_threshold() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cb = breaker(store);
        cb.record_failure("host-a", 0).await.unwrap();
        assert!(cb.admit("host-a", 0).await.unwrap());
        cb.record_failure("host-a", 0).await.unwrap();
        assert!(!cb.admit("host-a", 0).await.unwrap());
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_cooldown() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cb = breaker(store);
        cb.record_failure("host-a", 0).await.unwrap();
        cb.record_failure("host-a", 0).await.unwrap();
        assert!(!cb.admit("host-a", 1_000).await.unwrap());

        let ok = cb.admit("host-a", 120_000).await.unwrap();
        assert!(ok);
        assert_eq!(cb.state("host-a").await.unwrap().state, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_success_closes_circuit() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cb = breaker(store);
        cb.record_failure("host-a", 0).await.unwrap();
        cb.record_failure("host-a", 0).await.unwrap();
        cb.admit("host-a", 120_000).await.unwrap();
        cb.record_success("host-a", 120_100).await.unwrap();

        let state = cb.state("host-a").await.unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cb = breaker(store);
        cb.record_failure("host-a", 0).await.unwrap();
        cb.record_failure("host-a", 0).await.unwrap();
        cb.admit("host-a", 120_000).await.unwrap();
        cb.record_failure("host-a", 120_100).await.unwrap();

        let state = cb.state("host-a").await.unwrap();
        assert_eq!(state.state, CircuitState::Open);
    }
}
