//! Quarantine registry persistence (§4.7): exact, case-sensitive match on
//! `(scope, target)`. Expired entries are swept lazily on every read rather
//! than by a background task, so a read never observes a stale quarantine.

use super::Store;
use crate::error::StoreError;
use crate::types::QuarantineScope;
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone)]
pub struct QuarantineEntry {
    pub scope: QuarantineScope,
    pub target: String,
    pub reason: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub created_by: Option<String>,
}

impl Store {
    /// Insert or replace a quarantine entry for `(scope, target)`.
    pub async fn upsert_quarantine(&self, entry: &QuarantineEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO quarantine (scope, target, reason, created_at, expires_at, created_by)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(scope, target) DO UPDATE SET
                reason=excluded.reason, created_at=excluded.created_at,
                expires_at=excluded.expires_at, created_by=excluded.created_by",
            params![
                entry.scope.as_str(),
                entry.target,
                entry.reason,
                entry.created_at,
                entry.expires_at,
                entry.created_by,
            ],
        )?;
        Ok(())
    }

    pub async fn remove_quarantine(
        &self,
        scope: QuarantineScope,
        target: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "DELETE FROM quarantine WHERE scope = ?1 AND target = ?2",
            params![scope.as_str(), target],
        )?;
        Ok(rows > 0)
    }

    /// Sweeps expired rows, then looks up `(scope, target)` exactly
    /// (case-sensitive, no normalization).
    pub async fn is_quarantined(
        &self,
        scope: QuarantineScope,
        target: &str,
        now_ms: i64,
    ) -> Result<Option<QuarantineEntry>, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM quarantine WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now_ms],
        )?;

        conn.query_row(
            "SELECT scope, target, reason, created_at, expires_at, created_by
             FROM quarantine WHERE scope = ?1 AND target = ?2",
            params![scope.as_str(), target],
            |row| {
                let scope_str: String = row.get(0)?;
                Ok((
                    scope_str,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?
        .map(|(scope_str, target, reason, created_at, expires_at, created_by)| {
            Ok(QuarantineEntry {
                scope: QuarantineScope::parse(&scope_str)
                    .map_err(|e| StoreError::Constraint(e.to_string()))?,
                target,
                reason,
                created_at,
                expires_at,
                created_by,
            })
        })
        .transpose()
    }

    pub async fn list_quarantine(&self, now_ms: i64) -> Result<Vec<QuarantineEntry>, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM quarantine WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now_ms],
        )?;
        let mut stmt = conn.prepare(
            "SELECT scope, target, reason, created_at, expires_at, created_by FROM quarantine
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let scope_str: String = row.get(0)?;
            Ok((
                scope_str,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (scope_str, target, reason, created_at, expires_at, created_by) = r?;
            out.push(QuarantineEntry {
                scope: QuarantineScope::parse(&scope_str)
                    .map_err(|e| StoreError::Constraint(e.to_string()))?,
                target,
                reason,
                created_at,
                expires_at,
                created_by,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(scope: QuarantineScope, target: &str, expires_at: Option<i64>) -> QuarantineEntry {
        QuarantineEntry {
            scope,
            target: target.to_string(),
            reason: "suspicious".to_string(),
            created_at: 0,
            expires_at,
            created_by: Some("operator".to_string()),
        }
    }

    #[tokio::test]
    async fn exact_case_sensitive_match() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_quarantine(&entry(QuarantineScope::Host, "Evil-Host", None))
            .await
            .unwrap();
        assert!(store
            .is_quarantined(QuarantineScope::Host, "Evil-Host", 0)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .is_quarantined(QuarantineScope::Host, "evil-host", 0)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn scope_is_part_of_the_key() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_quarantine(&entry(QuarantineScope::Host, "shared-name", None))
            .await
            .unwrap();
        assert!(store
            .is_quarantined(QuarantineScope::Tool, "shared-name", 0)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_swept_on_read() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_quarantine(&entry(QuarantineScope::Agent, "agent-x", Some(1_000)))
            .await
            .unwrap();
        assert!(store
            .is_quarantined(QuarantineScope::Agent, "agent-x", 500)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .is_quarantined(QuarantineScope::Agent, "agent-x", 1_500)
            .await
            .unwrap()
            .is_none());
        assert!(store.list_quarantine(1_500).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_quarantine(&entry(QuarantineScope::Host, "h1", None))
            .await
            .unwrap();
        assert!(store
            .remove_quarantine(QuarantineScope::Host, "h1")
            .await
            .unwrap());
        assert!(store
            .is_quarantined(QuarantineScope::Host, "h1", 0)
            .await
            .unwrap()
            .is_none());
    }
}
