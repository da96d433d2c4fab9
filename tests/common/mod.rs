use pg_large_notify::{HostContext, LargePayloadAdapter, MessageHandler, RelayConfig};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// How long a test waits for a notification before giving up
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Test database utilities for pg-large-notify integration tests
#[derive(Debug)]
pub struct TestDb {
    pub pool: PgPool,
    pub database_url: String,
    pub test_id: String,
    pub staging_table: String,
}

impl TestDb {
    /// Connect using DATABASE_URL.
    ///
    /// Returns `None` (and the calling test is skipped) when no database is
    /// configured or reachable.
    pub async fn connect() -> Option<Self> {
        pg_large_notify::logging::init_structured_logging();

        let Some(database_url) = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty())
        else {
            eprintln!("DATABASE_URL not set, skipping PostgreSQL integration test");
            return None;
        };

        let pool = match PgPool::connect(&database_url).await {
            Ok(pool) => pool,
            Err(e) => {
                eprintln!("Couldn't connect to PostgreSQL ({e}), skipping integration test");
                return None;
            }
        };

        let test_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let staging_table = format!("large_notify_payloads_{test_id}");

        Some(TestDb {
            pool,
            database_url,
            test_id,
            staging_table,
        })
    }

    /// Channel name unique to this test
    pub fn channel(&self, base: &str) -> String {
        format!("{}_{}", base, self.test_id)
    }

    /// Config pointing at this test's staging table with a fresh secret
    pub fn config(&self) -> RelayConfig {
        RelayConfig::new()
            .with_staging_table(self.staging_table.clone())
            .with_payload_encryptor_secret(Uuid::new_v4().to_string())
    }

    /// Adapter that borrows the test pool
    pub fn adapter(&self, config: RelayConfig) -> LargePayloadAdapter {
        self.adapter_with_host(config, HostContext::new().with_pool(self.pool.clone()))
    }

    pub fn adapter_with_host(&self, config: RelayConfig, host: HostContext) -> LargePayloadAdapter {
        LargePayloadAdapter::new(config, host).expect("Failed to build adapter")
    }

    /// Adapter with its own pool built from the database URL
    pub fn url_adapter(&self, config: RelayConfig) -> LargePayloadAdapter {
        LargePayloadAdapter::new(config.with_url(self.database_url.clone()), HostContext::new())
            .expect("Failed to build adapter")
    }

    pub async fn staged_count(&self) -> i64 {
        let query = format!("SELECT COUNT(*) AS count FROM {}", self.staging_table);
        let row = sqlx::query(&query)
            .fetch_one(&self.pool)
            .await
            .expect("Failed to count staged payloads");
        row.get("count")
    }

    pub async fn staged_ids(&self) -> Vec<i32> {
        let query = format!("SELECT id FROM {} ORDER BY id", self.staging_table);
        sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .expect("Failed to read staged ids")
            .iter()
            .map(|row| row.get("id"))
            .collect()
    }

    pub async fn table_exists(&self) -> bool {
        let row = sqlx::query("SELECT to_regclass($1) IS NOT NULL AS present")
            .bind(&self.staging_table)
            .fetch_one(&self.pool)
            .await
            .expect("Failed to check staging table");
        row.get("present")
    }

    pub async fn drop_table(&self) {
        let query = format!("DROP TABLE IF EXISTS {}", self.staging_table);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .expect("Failed to drop staging table");
    }

    /// Send a raw NOTIFY, bypassing the publisher
    pub async fn raw_notify(&self, identifier: &str, payload: &str) {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(identifier)
            .bind(payload)
            .execute(&self.pool)
            .await
            .expect("Failed to send raw notification");
    }

    pub async fn application_names(&self) -> Vec<String> {
        sqlx::query("SELECT application_name FROM pg_stat_activity")
            .fetch_all(&self.pool)
            .await
            .expect("Failed to read pg_stat_activity")
            .iter()
            .filter_map(|row| row.get::<Option<String>, _>("application_name"))
            .collect()
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let query = format!("DROP TABLE IF EXISTS {}", self.staging_table);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = sqlx::query(&query).execute(&pool).await;
            });
        }
    }
}

/// Handler that forwards every delivery into a queue the test can pop from
pub fn queue_handler() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<(String, String)>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let handler: Arc<dyn MessageHandler> = Arc::new(move |channel: &str, payload: String| {
        let _ = sender.send((channel.to_string(), payload));
    });
    (handler, receiver)
}

/// Pop the next delivery or fail after [`RECEIVE_TIMEOUT`]
pub async fn pop(receiver: &mut mpsc::UnboundedReceiver<(String, String)>) -> (String, String) {
    tokio::time::timeout(RECEIVE_TIMEOUT, receiver.recv())
        .await
        .expect("Timed out waiting for a notification")
        .expect("Handler queue closed")
}

/// Assert nothing arrives within a short window.
///
/// A closed queue counts as nothing received: unsubscribing drops the
/// handler, and with it the sending half.
pub async fn assert_nothing_received(receiver: &mut mpsc::UnboundedReceiver<(String, String)>) {
    match tokio::time::timeout(Duration::from_millis(300), receiver.recv()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(delivery)) => panic!("Unexpected delivery: {delivery:?}"),
    }
}
