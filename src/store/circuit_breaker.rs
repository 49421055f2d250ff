//! Per-host circuit breaker persistence (§4.3).
//!
//! One row per host. `failure_count` resets to zero on every success or on
//! the closed->half-open->closed recovery path; `opened_at`/`half_open_at`
//! record the timestamps the FSM transitions need to know whether cooldown
//! has elapsed.

use super::Store;
use crate::error::StoreError;
use crate::types::CircuitState;
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub host: String,
    pub state: CircuitState,
    pub failure_count: i64,
    pub last_failure: Option<i64>,
    pub last_success: Option<i64>,
    pub opened_at: Option<i64>,
    pub half_open_at: Option<i64>,
}

impl CircuitBreakerState {
    fn closed(host: &str) -> Self {
        CircuitBreakerState {
            host: host.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            last_success: None,
            opened_at: None,
            half_open_at: None,
        }
    }
}

impl Store {
    /// Fetches the breaker row for `host`, synthesizing a closed/zero-failure
    /// row if none exists yet — a host is closed until proven otherwise.
    pub async fn get_circuit_breaker(&self, host: &str) -> Result<CircuitBreakerState, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT host, state, failure_count, last_failure, last_success, opened_at, half_open_at
                 FROM circuit_breakers WHERE host = ?1",
                [host],
                |row| {
                    let state_str: String = row.get(1)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        state_str,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((host, state_str, failure_count, last_failure, last_success, opened_at, half_open_at)) => {
                let state = CircuitState::parse(&state_str)
                    .map_err(|e| StoreError::Constraint(e.to_string()))?;
                Ok(CircuitBreakerState {
                    host,
                    state,
                    failure_count,
                    last_failure,
                    last_success,
                    opened_at,
                    half_open_at,
                })
            }
            None => Ok(CircuitBreakerState::closed(host)),
        }
    }

    pub async fn put_circuit_breaker(&self, cb: &CircuitBreakerState) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO circuit_breakers (host, state, failure_count, last_failure, last_success, opened_at, half_open_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(host) DO UPDATE SET
                state=excluded.state, failure_count=excluded.failure_count,
                last_failure=excluded.last_failure, last_success=excluded.last_success,
                opened_at=excluded.opened_at, half_open_at=excluded.half_open_at",
            params![
                cb.host,
                cb.state.as_str(),
                cb.failure_count,
                cb.last_failure,
                cb.last_success,
                cb.opened_at,
                cb.half_open_at,
            ],
        )?;
        Ok(())
    }

    pub async fn list_circuit_breakers(&self) -> Result<Vec<CircuitBreakerState>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT host, state, failure_count, last_failure, last_success, opened_at, half_open_at
             FROM circuit_breakers ORDER BY host ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let state_str: String = row.get(1)?;
            Ok((
                row.get::<_, String>(0)?,
                state_str,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, Option<i64>>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (host, state_str, failure_count, last_failure, last_success, opened_at, half_open_at) = r?;
            let state = CircuitState::parse(&state_str)
                .map_err(|e| StoreError::Constraint(e.to_string()))?;
            out.push(CircuitBreakerState {
                host,
                state,
                failure_count,
                last_failure,
                last_success,
                opened_at,
                half_open_at,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_host_is_closed_with_no_failures() {
        let store = Store::open_in_memory().unwrap();
        let cb = store.get_circuit_breaker("host-a").await.unwrap();
        assert_eq!(cb.state, CircuitState::Closed);
        assert_eq!(cb.failure_count, 0);
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let mut cb = CircuitBreakerState::closed("host-a");
        cb.state = CircuitState::Open;
        cb.failure_count = 3;
        cb.opened_at = Some(1_000);
        store.put_circuit_breaker(&cb).await.unwrap();

        let fetched = store.get_circuit_breaker("host-a").await.unwrap();
        assert_eq!(fetched.state, CircuitState::Open);
        assert_eq!(fetched.failure_count, 3);
        assert_eq!(fetched.opened_at, Some(1_000));
    }

    #[tokio::test]
    async fn list_returns_all_known_hosts() {
        let store = Store::open_in_memory().unwrap();
        store
            .put_circuit_breaker(&CircuitBreakerState::closed("a"))
            .await
            .unwrap();
        store
            .put_circuit_breaker(&CircuitBreakerState::closed("b"))
            .await
            .unwrap();
        let all = store.list_circuit_breakers().await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
