//! # Connection management
//!
//! Short-lived pooled connections serve publishing and staged-payload
//! lookups. Each listener gets its own dedicated, long-lived connection that
//! never returns to the pool, so a blocking LISTEN cannot starve publishers
//! or hit the acquire timeout.

use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use sqlx::{PgPool, Postgres};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::{resolve_pool_size, HostContext, RelayConfig};
use crate::error::{RelayError, Result};

/// Where connections come from, decided once at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSource {
    /// The relay opened its own pool from an explicit URL
    Dedicated,
    /// The host application's pool is borrowed
    Host,
}

/// Hands out publish connections and opens listener connections
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    pool: PgPool,
    source: ConnectionSource,
    acquire_timeout: Duration,
}

impl ConnectionManager {
    /// Build from configuration: an explicit `url` gets its own bounded pool,
    /// otherwise the host pool is reused.
    pub fn from_config(config: &RelayConfig, host: &HostContext) -> Result<Self> {
        match (&config.url, &host.pool) {
            (Some(url), _) => {
                let options = PgConnectOptions::from_str(url).map_err(|e| {
                    RelayError::config(format!("invalid database url: {e}"))
                })?;
                let max_connections = resolve_pool_size(config, host);
                info!(
                    max_connections,
                    acquire_timeout_ms = config.acquire_timeout_ms,
                    "Creating dedicated publish pool"
                );
                Ok(Self::with_options(
                    options,
                    max_connections,
                    config.acquire_timeout(),
                ))
            }
            (None, Some(pool)) => Ok(Self::from_host_pool(pool.clone())),
            (None, None) => Err(RelayError::config(
                "no database target: configure a url or provide a host pool",
            )),
        }
    }

    /// Own a lazily-connecting pool with the given bounds
    pub fn with_options(
        options: PgConnectOptions,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy_with(options);
        Self {
            pool,
            source: ConnectionSource::Dedicated,
            acquire_timeout,
        }
    }

    /// Borrow the host application's pool
    pub fn from_host_pool(pool: PgPool) -> Self {
        debug!("Using host connection pool");
        let acquire_timeout = pool.options().get_acquire_timeout();
        Self {
            pool,
            source: ConnectionSource::Host,
            acquire_timeout,
        }
    }

    pub fn source(&self) -> ConnectionSource {
        self.source
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check out a connection for one operation.
    ///
    /// The connection goes back to the pool when the guard drops, on every
    /// exit path. A timeout while every slot is checked out is
    /// [`RelayError::PoolTimeout`]; a timeout with free slots means new
    /// connections could not be opened and is [`RelayError::Connection`].
    pub async fn publish_connection(&self) -> Result<PoolConnection<Postgres>> {
        self.pool.acquire().await.map_err(|e| match RelayError::from(e) {
            RelayError::PoolTimeout if self.has_free_slots() => {
                warn!("Timed out opening a publish connection");
                RelayError::Connection(sqlx::Error::PoolTimedOut)
            }
            RelayError::PoolTimeout => {
                warn!("Publish pool exhausted");
                RelayError::PoolTimeout
            }
            RelayError::Database(e) => RelayError::Connection(e),
            other => other,
        })
    }

    fn has_free_slots(&self) -> bool {
        self.pool.size() < self.pool.options().get_max_connections()
    }

    /// Open a dedicated listen connection tagged with `identifier`.
    ///
    /// The listener keeps a private single-connection pool for reconnects, so
    /// it is unaffected by the publish pool being drained or reset. Nothing
    /// else draws from that pool, so a timeout there is always a failure to
    /// connect.
    #[instrument(skip(self))]
    pub async fn listen_connection(&self, identifier: &str) -> Result<PgListener> {
        let options = self
            .pool
            .connect_options()
            .as_ref()
            .clone()
            .application_name(identifier);

        let listen_pool = PgPoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .acquire_timeout(self.acquire_timeout)
            .connect_lazy_with(options);

        let listener = PgListener::connect_with(&listen_pool)
            .await
            .map_err(|e| match RelayError::from(e) {
                RelayError::PoolTimeout => RelayError::Connection(sqlx::Error::PoolTimedOut),
                RelayError::Database(e) => RelayError::Connection(e),
                other => other,
            })?;

        info!(application_name = %identifier, "Opened dedicated listen connection");
        Ok(listener)
    }

    /// Close the pool if this manager created it
    pub async fn close(&self) {
        if self.source == ConnectionSource::Dedicated {
            self.pool.close().await;
        }
    }
}
