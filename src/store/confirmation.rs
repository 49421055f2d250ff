//! Confirmation token persistence (§4.8): single-use, context-bound tokens
//! minted when a rule's action is `ask`. `consume` is atomic — the row is
//! marked used in the same statement that checks it's still valid, so two
//! concurrent retries of the same call can't both succeed.

use super::Store;
use crate::error::StoreError;
use crate::types::Value;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

pub const DEFAULT_TTL_SECONDS: i64 = 300;

#[derive(Debug, Clone)]
pub struct ConfirmationToken {
    pub token: String,
    pub tool: String,
    pub host: String,
    pub agent: String,
    pub arguments: Value,
    pub created_at: i64,
    pub expires_at: i64,
    pub used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeError {
    NotFound,
    Expired,
    AlreadyUsed,
    ContextMismatch,
}

impl Store {
    pub async fn mint_confirmation_token(
        &self,
        tool: &str,
        host: &str,
        agent: &str,
        arguments: &Value,
        now_ms: i64,
        ttl_seconds: i64,
    ) -> Result<ConfirmationToken, StoreError> {
        let token = Uuid::new_v4().to_string();
        let args_json =
            serde_json::to_string(arguments).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let expires_at = now_ms + ttl_seconds * 1_000;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO confirmation_tokens (token, tool, host, agent, arguments_json, created_at, expires_at, used)
             VALUES (?1,?2,?3,?4,?5,?6,?7,0)",
            params![token, tool, host, agent, args_json, now_ms, expires_at],
        )?;

        Ok(ConfirmationToken {
            token,
            tool: tool.to_string(),
            host: host.to_string(),
            agent: agent.to_string(),
            arguments: arguments.clone(),
            created_at: now_ms,
            expires_at,
            used: false,
        })
    }

    /// Validates and marks a token used in one statement, bound to the
    /// exact `(tool, host, agent)` the caller is retrying.
    pub async fn consume_confirmation_token(
        &self,
        token: &str,
        tool: &str,
        host: &str,
        agent: &str,
        now_ms: i64,
    ) -> Result<Result<(), ConsumeError>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT tool, host, agent, expires_at, used FROM confirmation_tokens WHERE token = ?1",
                [token],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)? != 0,
                    ))
                },
            )
            .optional()?;

        let (row_tool, row_host, row_agent, expires_at, used) = match row {
            Some(r) => r,
            None => return Ok(Err(ConsumeError::NotFound)),
        };

        if used {
            return Ok(Err(ConsumeError::AlreadyUsed));
        }
        if now_ms >= expires_at {
            return Ok(Err(ConsumeError::Expired));
        }
        if row_tool != tool || row_host != host || row_agent != agent {
            return Ok(Err(ConsumeError::ContextMismatch));
        }

        let updated = conn.execute(
            "UPDATE confirmation_tokens SET used = 1 WHERE token = ?1 AND used = 0",
            [token],
        )?;
        if updated == 0 {
            return Ok(Err(ConsumeError::AlreadyUsed));
        }
        Ok(Ok(()))
    }

    /// Deletes expired tokens. Called opportunistically and from a
    /// background sweep; safe to call at any time.
    pub async fn prune_expired_tokens(&self, now_ms: i64) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "DELETE FROM confirmation_tokens WHERE expires_at <= ?1",
            [now_ms],
        )?;
        Ok(rows as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mint_then_consume_succeeds_once() {
        let store = Store::open_in_memory().unwrap();
        let tok = store
            .mint_confirmation_token("tool", "host", "agent", &Value::empty_map(), 0, 300)
            .await
            .unwrap();

        let first = store
            .consume_confirmation_token(&tok.token, "tool", "host", "agent", 1_000)
            .await
            .unwrap();
        assert!(first.is_ok());

        let second = store
            .consume_confirmation_token(&tok.token, "tool", "host", "agent", 1_000)
            .await
            .unwrap();
        assert_eq!(second, Err(ConsumeError::AlreadyUsed));
    }

    #[tokio::test]
    async fn consume_rejects_expired_token() {
        let store = Store::open_in_memory().unwrap();
        let tok = store
            .mint_confirmation_token("tool", "host", "agent", &Value::empty_map(), 0, 5)
            .await
            .unwrap();
        let result = store
            .consume_confirmation_token(&tok.token, "tool", "host", "agent", 10_000)
            .await
            .unwrap();
        assert_eq!(result, Err(ConsumeError::Expired));
    }

    #[tokio::test]
    async fn consume_rejects_context_mismatch() {
        let store = Store::open_in_memory().unwrap();
        let tok = store
            .mint_confirmation_token("tool", "host", "agent", &Value::empty_map(), 0, 300)
            .await
            .unwrap();
        let result = store
            .consume_confirmation_token(&tok.token, "other-tool", "host", "agent", 1_000)
            .await
            .unwrap();
        assert_eq!(result, Err(ConsumeError::ContextMismatch));
    }

    #[tokio::test]
    async fn consume_rejects_unknown_token() {
        let store = Store::open_in_memory().unwrap();
        let result = store
            .consume_confirmation_token("not-a-real-token", "tool", "host", "agent", 1_000)
            .await
            .unwrap();
        assert_eq!(result, Err(ConsumeError::NotFound));
    }

    #[tokio::test]
    async fn prune_removes_only_expired_tokens() {
        let store = Store::open_in_memory().unwrap();
        store
            .mint_confirmation_token("a", "h", "ag", &Value::empty_map(), 0, 5)
            .await
            .unwrap();
        let live = store
            .mint_confirmation_token("b", "h", "ag", &Value::empty_map(), 0, 300)
            .await
            .unwrap();

        let pruned = store.prune_expired_tokens(10_000).await.unwrap();
        assert_eq!(pruned, 1);

        let result = store
            .consume_confirmation_token(&live.token, "b", "h", "ag", 10_000)
            .await
            .unwrap();
        assert!(result.is_ok());
    }
}
