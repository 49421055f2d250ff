//! Append-only audit log (§4.6): business-logic wrapper that redacts
//! arguments before they ever reach the hash chain, and exposes verification
//! as a plain library call so both the CLI and a periodic background task
//! can invoke it.

use crate::redact::redact;
use crate::store::audit::{AuditEntry, AuditQuery, VerifyReport};
use crate::store::Store;
use crate::types::{Action, PolicyVerdict, Value};
use std::sync::Arc;

pub struct AuditLog {
    store: Arc<Store>,
}

impl AuditLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Records one decision. `arguments` is redacted before it is hashed or
    /// persisted, so sensitive values never enter the chain at all.
    pub async fn record(
        &self,
        tool: &str,
        host: &str,
        agent: &str,
        arguments: &Value,
        verdict: &PolicyVerdict,
        mode: &str,
        timestamp_ms: i64,
    ) -> Result<AuditEntry, crate::error::StoreError> {
        let redacted = redact(arguments);
        self.store
            .append_audit_entry(
                timestamp_ms,
                tool,
                host,
                agent,
                &redacted,
                verdict.verdict(),
                verdict.action,
                verdict.matched_rule_id.as_deref(),
                verdict.risk_score,
                &verdict.risk_factors,
                mode,
            )
            .await
    }

    pub async fn record_response(
        &self,
        sequence_number: u64,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<(), crate::error::StoreError> {
        self.store
            .set_audit_response(sequence_number, status, error_message)
            .await
    }

    pub async fn query(&self, q: &AuditQuery) -> Result<Vec<AuditEntry>, crate::error::StoreError> {
        self.store.query_audit(q).await
    }

    pub async fn verify(&self) -> Result<VerifyReport, crate::error::StoreError> {
        self.store.verify_audit_chain().await
    }
}

/// True if `action` should still be recorded even though it's not a denial
/// — `log-only` rules allow the call but still want a trail entry distinct
/// from an ordinary `allow`.
pub fn is_log_only(action: Action) -> bool {
    matches!(action, Action::LogOnly)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RiskFactor, Verdict};
    use serde_json::json;

    fn verdict() -> PolicyVerdict {
        PolicyVerdict {
            allowed: true,
            action: Action::Allow,
            reason: "default".to_string(),
            matched_rule_id: None,
            risk_score: 10.0,
            risk_factors: vec![RiskFactor {
                factor: "frequency".to_string(),
                score: 10.0,
                details: "nominal".to_string(),
            }],
            requires_confirmation: false,
            confirmation_token: None,
            retry_after_seconds: None,
        }
    }

    #[tokio::test]
    async fn recorded_arguments_are_redacted() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let log = AuditLog::new(store);
        let args = Value::from_json(&json!({ "password": "hunter2", "host": "x" }));

        let entry = log
            .record("tool", "host", "agent", &args, &verdict(), "alert", 0)
            .await
            .unwrap();

        let json_args = entry.arguments.to_json();
        assert_eq!(json_args["password"], "[REDACTED]");
        assert_eq!(json_args["host"], "x");
    }

    #[tokio::test]
    async fn verify_matches_store_level_verification() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let log = AuditLog::new(store);
        log.record("tool", "host", "agent", &Value::empty_map(), &verdict(), "alert", 0)
            .await
            .unwrap();
        let report = log.verify().await.unwrap();
        assert!(report.valid);
    }
}
