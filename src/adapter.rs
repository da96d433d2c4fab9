//! # Large-payload pub/sub adapter
//!
//! Ties the publisher, the staged-payload resolver, the listener and the
//! dispatch loop together behind `broadcast` / `subscribe`.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::channel::channel_identifier;
use crate::codec::ReferenceCodec;
use crate::config::{resolve_secret, HostContext, RelayConfig, SECRET_ENV_VAR};
use crate::dispatch::{DispatchLoop, MessageHandler};
use crate::error::{RelayError, Result};
use crate::listener::{ListenerStats, NotificationListener};
use crate::pool::ConnectionManager;
use crate::publisher::{PgPublisher, Publisher};
use crate::resolver::{InlineResolver, StagedPayloadResolver};
use crate::store::StagingStore;

/// Listener plus the dispatch loop it feeds
struct ListenerRuntime {
    listener: NotificationListener,
    dispatch: DispatchLoop,
}

impl ListenerRuntime {
    /// Stop the listener, then drain the dispatch loop
    async fn stop(self) -> u64 {
        let Self {
            mut listener,
            dispatch,
        } = self;
        listener.stop().await;
        drop(listener);
        dispatch.shutdown().await
    }
}

/// The running listener, if any, and every handler registered through the
/// adapter so a replacement listener can be subscribed again
#[derive(Default)]
struct ListenerSlot {
    runtime: Option<ListenerRuntime>,
    handlers: Vec<(String, Arc<dyn MessageHandler>)>,
}

/// Pub/sub over LISTEN/NOTIFY that carries payloads of any size
pub struct LargePayloadAdapter {
    config: RelayConfig,
    connections: ConnectionManager,
    codec: Arc<ReferenceCodec>,
    store: StagingStore,
    publisher: PgPublisher,
    slot: Mutex<ListenerSlot>,
}

impl std::fmt::Debug for LargePayloadAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargePayloadAdapter")
            .field("config", &self.config)
            .field("source", &self.connections.source())
            .finish()
    }
}

impl LargePayloadAdapter {
    /// Build the adapter, resolving the token secret from the config, the host
    /// and `SECRET_KEY_BASE`, in that order.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: RelayConfig, host: HostContext) -> Result<Self> {
        Self::with_secret_env(config, host, SECRET_ENV_VAR)
    }

    /// Like [`LargePayloadAdapter::new`] with a different fallback variable
    pub fn with_secret_env(config: RelayConfig, host: HostContext, env_var: &str) -> Result<Self> {
        config.validate()?;

        let secret = resolve_secret(&config, &host, env_var)?;
        let codec = Arc::new(ReferenceCodec::new(&secret)?);
        let connections = ConnectionManager::from_config(&config, &host)?;
        let store = StagingStore::new(config.staging_table.clone());
        let publisher = PgPublisher::new(
            &config,
            connections.clone(),
            Arc::clone(&codec),
            store.clone(),
        );

        info!(
            source = ?connections.source(),
            staging_table = %store.table(),
            max_notify_size = config.max_notify_size,
            "Large payload adapter ready"
        );

        Ok(Self {
            config,
            connections,
            codec,
            store,
            publisher,
            slot: Mutex::new(ListenerSlot::default()),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Broadcast `payload` on `channel`, staging it when it is too large
    pub async fn broadcast(&self, channel: &str, payload: &str) -> Result<()> {
        self.publisher.broadcast(channel, payload).await
    }

    /// Register `handler` for `channel`, starting the listener on first use.
    ///
    /// A listener whose task has ended is replaced, and every handler
    /// registered so far is subscribed on the replacement.
    #[instrument(skip(self, handler))]
    pub async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut slot = self.slot.lock().await;
        self.ensure_running(&mut slot).await?;
        let runtime = slot.runtime.as_ref().ok_or(RelayError::NotListening)?;

        runtime
            .listener
            .subscribe(
                self.identifier(channel),
                channel.to_string(),
                Arc::clone(&handler),
            )
            .await?;
        slot.handlers.push((channel.to_string(), handler));
        Ok(())
    }

    /// Remove every handler registered for `channel` and stop listening on it.
    ///
    /// Handlers are not removed individually; subscribe the remaining ones
    /// again after unsubscribing if only one should go.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let mut slot = self.slot.lock().await;
        slot.handlers.retain(|(subscribed, _)| subscribed != channel);
        match slot.runtime.as_ref() {
            Some(runtime) => runtime.listener.unsubscribe(self.identifier(channel)).await,
            None => Ok(()),
        }
    }

    async fn ensure_running(&self, slot: &mut ListenerSlot) -> Result<()> {
        match slot.runtime.take() {
            Some(runtime) if runtime.listener.is_running() => {
                slot.runtime = Some(runtime);
                return Ok(());
            }
            Some(runtime) => {
                warn!(
                    handlers = slot.handlers.len(),
                    "Listener task ended unexpectedly, starting a new one"
                );
                runtime.stop().await;
            }
            None => {}
        }

        let runtime = self.start_listener().await?;
        for (channel, handler) in &slot.handlers {
            runtime
                .listener
                .subscribe(self.identifier(channel), channel.clone(), Arc::clone(handler))
                .await?;
        }
        slot.runtime = Some(runtime);
        Ok(())
    }

    async fn start_listener(&self) -> Result<ListenerRuntime> {
        let dispatch = DispatchLoop::spawn(self.config.dispatch_buffer_size);
        let resolver = Arc::new(StagedPayloadResolver::new(
            InlineResolver,
            Arc::clone(&self.codec),
            self.store.clone(),
            self.connections.clone(),
        ));

        let listener = match NotificationListener::start(
            &self.connections,
            &self.config.listener_identifier(),
            resolver,
            dispatch.handle(),
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => {
                dispatch.shutdown().await;
                return Err(e);
            }
        };

        Ok(ListenerRuntime { listener, dispatch })
    }

    fn identifier(&self, channel: &str) -> String {
        channel_identifier(self.config.channel_prefix.as_deref(), channel)
    }

    /// Whether a listener is currently running
    pub async fn is_listening(&self) -> bool {
        self.slot
            .lock()
            .await
            .runtime
            .as_ref()
            .is_some_and(|runtime| runtime.listener.is_running())
    }

    pub async fn listener_stats(&self) -> Option<ListenerStats> {
        self.slot
            .lock()
            .await
            .runtime
            .as_ref()
            .map(|runtime| runtime.listener.stats())
    }

    pub async fn is_healthy(&self) -> bool {
        self.publisher.is_healthy().await
    }

    /// Stop the listener, drain the dispatch loop, and close an owned pool
    pub async fn shutdown(&self) {
        let runtime = {
            let mut slot = self.slot.lock().await;
            slot.handlers.clear();
            slot.runtime.take()
        };
        if let Some(runtime) = runtime {
            let dispatched = runtime.stop().await;
            debug!(dispatched, "Listener runtime stopped");
        }
        self.connections.close().await;
        info!("Large payload adapter shut down");
    }
}
