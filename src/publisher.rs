//! Broadcasting over NOTIFY, staging payloads that do not fit

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgConnection;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

use crate::channel::{channel_identifier, escape_identifier, escape_literal};
use crate::codec::ReferenceCodec;
use crate::config::{RelayConfig, LARGE_PAYLOAD_PREFIX};
use crate::error::Result;
use crate::pool::ConnectionManager;
use crate::store::{ReapPolicy, StagingStore};

/// Something that can broadcast a message on a channel
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Broadcast `payload` to every listener of `channel`
    async fn broadcast(&self, channel: &str, payload: &str) -> Result<()>;

    /// Check the publisher can reach the database
    async fn is_healthy(&self) -> bool;
}

/// Whether an escaped payload must go through the staging table
pub fn needs_staging(payload: &str, escaped: &str, max_notify_size: usize) -> bool {
    escaped.len() > max_notify_size || payload.starts_with(LARGE_PAYLOAD_PREFIX)
}

/// Render the NOTIFY command for an already-quoted channel and escaped body
pub fn notify_command(quoted_channel: &str, escaped_body: &str) -> String {
    format!("NOTIFY {quoted_channel}, '{escaped_body}'")
}

/// Publisher backed by `PostgreSQL` NOTIFY with overflow staging
pub struct PgPublisher {
    connections: ConnectionManager,
    codec: Arc<ReferenceCodec>,
    store: StagingStore,
    reap_policy: ReapPolicy,
    channel_prefix: Option<String>,
    max_notify_size: usize,
}

impl std::fmt::Debug for PgPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPublisher")
            .field("store", &self.store)
            .field("reap_policy", &self.reap_policy)
            .field("channel_prefix", &self.channel_prefix)
            .field("max_notify_size", &self.max_notify_size)
            .field("pool", &"PgPool")
            .finish()
    }
}

impl PgPublisher {
    pub fn new(
        config: &RelayConfig,
        connections: ConnectionManager,
        codec: Arc<ReferenceCodec>,
        store: StagingStore,
    ) -> Self {
        Self {
            connections,
            codec,
            store,
            reap_policy: ReapPolicy::new(config.inserts_per_delete, config.retention()),
            channel_prefix: config.channel_prefix.clone(),
            max_notify_size: config.max_notify_size,
        }
    }

    /// Stage the payload and return the reference that replaces it
    async fn stage(&self, conn: &mut PgConnection, payload: &str) -> Result<String> {
        let id = self.store.insert(conn, payload).await?;

        if self.reap_policy.should_reap(id) {
            let cutoff = self.reap_policy.cutoff(Utc::now());
            // A failed sweep must not fail the broadcast
            if let Err(e) = self.store.reap(conn, cutoff).await {
                warn!(id, error = %e, "Failed to reap staged payloads");
            }
        }

        let token = self.codec.encode(id)?;
        debug!(id, bytes = payload.len(), "Staged oversized payload");
        Ok(format!("{LARGE_PAYLOAD_PREFIX}{token}"))
    }
}

#[async_trait]
impl Publisher for PgPublisher {
    #[instrument(skip(self, payload), fields(channel = %channel, bytes = payload.len()))]
    async fn broadcast(&self, channel: &str, payload: &str) -> Result<()> {
        let identifier = channel_identifier(self.channel_prefix.as_deref(), channel);
        let quoted_channel = escape_identifier(&identifier)?;
        let escaped = escape_literal(payload)?;

        let mut conn = self.connections.publish_connection().await?;

        let body = if needs_staging(payload, &escaped, self.max_notify_size) {
            self.stage(&mut conn, payload).await?
        } else {
            escaped
        };

        let sql = notify_command(&quoted_channel, &body);
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&sql))
            .await
            .map_err(|e| {
                error!("Failed to send notification to channel {}: {}", identifier, e);
                e
            })?;

        debug!("Sent notification to channel: {}", identifier);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        match self.connections.publish_connection().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Publisher health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_boundary() {
        let at_limit = "a".repeat(7997);
        let over_limit = "a".repeat(7998);

        assert!(!needs_staging(&at_limit, &at_limit, 7997));
        assert!(needs_staging(&over_limit, &over_limit, 7997));
    }

    #[test]
    fn test_threshold_counts_escaped_bytes() {
        // 7990 bytes raw, 8000 once the ten quotes are doubled
        let payload = format!("{}{}", "a".repeat(7980), "'".repeat(10));
        let escaped = escape_literal(&payload).unwrap();
        assert_eq!(payload.len(), 7990);
        assert!(needs_staging(&payload, &escaped, 7997));
    }

    #[test]
    fn test_threshold_counts_bytes_not_chars() {
        // 3000 chars, 8000 bytes
        let payload = "é€".repeat(1000) + &"€".repeat(1000);
        assert!(payload.chars().count() < 7997);
        assert!(needs_staging(&payload, &payload, 7997));
    }

    #[test]
    fn test_marker_prefixed_payloads_are_always_staged() {
        let payload = format!("{LARGE_PAYLOAD_PREFIX}not-a-token");
        assert!(needs_staging(&payload, &payload, 7997));
    }

    #[test]
    fn test_notify_command() {
        let channel = escape_identifier("app:chat").unwrap();
        let body = escape_literal("it's here").unwrap();
        assert_eq!(
            notify_command(&channel, &body),
            r#"NOTIFY "app:chat", 'it''s here'"#
        );
    }
}
