//! Confirmation token lifecycle (§4.8): thin wrapper binding the store's
//! mint/consume primitives to the process-wide default TTL.

use crate::store::confirmation::{ConfirmationToken, ConsumeError, DEFAULT_TTL_SECONDS};
use crate::store::Store;
use crate::types::{PolicyContext, Value};
use std::sync::Arc;

pub struct ConfirmationTokens {
    store: Arc<Store>,
    ttl_seconds: i64,
}

impl ConfirmationTokens {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            ttl_seconds: DEFAULT_TTL_SECONDS,
        }
    }

    pub fn with_ttl_seconds(store: Arc<Store>, ttl_seconds: i64) -> Self {
        Self { store, ttl_seconds }
    }

    pub async fn mint(
        &self,
        ctx: &PolicyContext,
        now_ms: i64,
    ) -> Result<ConfirmationToken, crate::error::StoreError> {
        self.store
            .mint_confirmation_token(&ctx.tool, &ctx.host, &ctx.agent, &ctx.arguments, now_ms, self.ttl_seconds)
            .await
    }

    /// Validates a presented token against the retrying call's context.
    pub async fn consume(
        &self,
        token: &str,
        ctx: &PolicyContext,
        now_ms: i64,
    ) -> Result<Result<(), ConsumeError>, crate::error::StoreError> {
        self.store
            .consume_confirmation_token(token, &ctx.tool, &ctx.host, &ctx.agent, now_ms)
            .await
    }

    pub async fn prune_expired(&self, now_ms: i64) -> Result<u64, crate::error::StoreError> {
        self.store.prune_expired_tokens(now_ms).await
    }
}
