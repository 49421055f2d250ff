//! Quarantine registry (§4.7): thin business-logic wrapper over the store
//! that checks all three scopes for one policy context in a single call.

use crate::store::quarantine::QuarantineEntry;
use crate::store::Store;
use crate::types::{PolicyContext, QuarantineScope};
use std::sync::Arc;

pub struct QuarantineRegistry {
    store: Arc<Store>,
}

impl QuarantineRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Checks host, tool, and agent scopes for `ctx`. Returns the first
    /// match found, checked in that order — host quarantines are the
    /// broadest blast radius and surface first.
    pub async fn check(
        &self,
        ctx: &PolicyContext,
        now_ms: i64,
    ) -> Result<Option<QuarantineEntry>, crate::error::StoreError> {
        if let Some(entry) = self
            .store
            .is_quarantined(QuarantineScope::Host, &ctx.host, now_ms)
            .await?
        {
            return Ok(Some(entry));
        }
        if let Some(entry) = self
            .store
            .is_quarantined(QuarantineScope::Tool, &ctx.tool, now_ms)
            .await?
        {
            return Ok(Some(entry));
        }
        if let Some(entry) = self
            .store
            .is_quarantined(QuarantineScope::Agent, &ctx.agent, now_ms)
            .await?
        {
            return Ok(Some(entry));
        }
        Ok(None)
    }

    pub async fn quarantine(
        &self,
        scope: QuarantineScope,
        target: &str,
        reason: &str,
        created_by: Option<&str>,
        now_ms: i64,
        ttl_seconds: Option<i64>,
    ) -> Result<(), crate::error::StoreError> {
        let entry = QuarantineEntry {
            scope,
            target: target.to_string(),
            reason: reason.to_string(),
            created_at: now_ms,
            expires_at: ttl_seconds.map(|s| now_ms + s * 1_000),
            created_by: created_by.map(str::to_string),
        };
        self.store.upsert_quarantine(&entry).await
    }

    pub async fn release(
        &self,
        scope: QuarantineScope,
        target: &str,
    ) -> Result<bool, crate::error::StoreError> {
        self.store.remove_quarantine(scope, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn ctx(tool: &str, host: &str, agent: &str) -> PolicyContext {
        PolicyContext {
            tool: tool.to_string(),
            host: host.to_string(),
            agent: agent.to_string(),
            arguments: Value::empty_map(),
            timestamp_ms: 0,
            confirmation_token: None,
        }
    }

    #[tokio::test]
    async fn host_scope_is_checked_first() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = QuarantineRegistry::new(store);
        registry
            .quarantine(QuarantineScope::Host, "bad-host", "compromised", None, 0, None)
            .await
            .unwrap();
        registry
            .quarantine(QuarantineScope::Tool, "risky-tool", "flagged", None, 0, None)
            .await
            .unwrap();

        let hit = registry
            .check(&ctx("risky-tool", "bad-host", "agent"), 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.scope, QuarantineScope::Host);
    }

    #[tokio::test]
    async fn unquarantined_context_passes() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = QuarantineRegistry::new(store);
        assert!(registry
            .check(&ctx("tool", "host", "agent"), 0)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn release_lifts_quarantine() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = QuarantineRegistry::new(store);
        registry
            .quarantine(QuarantineScope::Agent, "agent-x", "reason", None, 0, None)
            .await
            .unwrap();
        assert!(registry.release(QuarantineScope::Agent, "agent-x").await.unwrap());
        assert!(registry
            .check(&ctx("tool", "host", "agent-x"), 0)
            .await
            .unwrap()
            .is_none());
    }
}
