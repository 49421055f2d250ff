//! Token bucket persistence (§4.4), keyed by `(rule_id, tool, host, agent)`
//! so the same rule applies independent budgets per tool/host/agent tuple.

use super::Store;
use crate::error::StoreError;
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone)]
pub struct BucketRow {
    pub rule_id: String,
    pub tool: String,
    pub host: String,
    pub agent: String,
    pub tokens: f64,
    pub last_refill: i64,
}

impl Store {
    pub async fn get_bucket(
        &self,
        rule_id: &str,
        tool: &str,
        host: &str,
        agent: &str,
    ) -> Result<Option<BucketRow>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT rule_id, tool, host, agent, tokens, last_refill FROM rate_limit_buckets
             WHERE rule_id = ?1 AND tool = ?2 AND host = ?3 AND agent = ?4",
            params![rule_id, tool, host, agent],
            |row| {
                Ok(BucketRow {
                    rule_id: row.get(0)?,
                    tool: row.get(1)?,
                    host: row.get(2)?,
                    agent: row.get(3)?,
                    tokens: row.get(4)?,
                    last_refill: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub async fn put_bucket(&self, bucket: &BucketRow, created_at: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO rate_limit_buckets (rule_id, tool, host, agent, tokens, last_refill, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(rule_id, tool, host, agent) DO UPDATE SET
                tokens=excluded.tokens, last_refill=excluded.last_refill",
            params![
                bucket.rule_id,
                bucket.tool,
                bucket.host,
                bucket.agent,
                bucket.tokens,
                bucket.last_refill,
                created_at,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_bucket_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store
            .get_bucket("r1", "tool", "host", "agent")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let bucket = BucketRow {
            rule_id: "r1".to_string(),
            tool: "tool".to_string(),
            host: "host".to_string(),
            agent: "agent".to_string(),
            tokens: 4.5,
            last_refill: 1_000,
        };
        store.put_bucket(&bucket, 500).await.unwrap();
        let fetched = store
            .get_bucket("r1", "tool", "host", "agent")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.tokens, 4.5);
        assert_eq!(fetched.last_refill, 1_000);
    }

    #[tokio::test]
    async fn distinct_agents_get_distinct_buckets() {
        let store = Store::open_in_memory().unwrap();
        let a = BucketRow {
            rule_id: "r1".to_string(),
            tool: "t".to_string(),
            host: "h".to_string(),
            agent: "agent-a".to_string(),
            tokens: 1.0,
            last_refill: 0,
        };
        let b = BucketRow {
            agent: "agent-b".to_string(),
            tokens: 9.0,
            ..a.clone()
        };
        store.put_bucket(&a, 0).await.unwrap();
        store.put_bucket(&b, 0).await.unwrap();

        assert_eq!(
            store.get_bucket("r1", "t", "h", "agent-a").await.unwrap().unwrap().tokens,
            1.0
        );
        assert_eq!(
            store.get_bucket("r1", "t", "h", "agent-b").await.unwrap().unwrap().tokens,
            9.0
        );
    }
}
