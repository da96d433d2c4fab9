//! Notification listener using a dedicated `sqlx::PgListener` connection

use parking_lot::RwLock;
use sqlx::postgres::{PgListener, PgNotification};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::LARGE_PAYLOAD_PREFIX;
use crate::dispatch::{Delivery, DispatchHandle, MessageHandler};
use crate::error::{RelayError, Result};
use crate::pool::ConnectionManager;
use crate::resolver::Resolver;

const COMMAND_BUFFER_SIZE: usize = 64;

const INITIAL_RECONNECT_BACKOFF: Duration = Duration::from_millis(250);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Where the listener loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerState {
    #[default]
    Idle,
    Listening,
    Resolving,
    Delivering,
    Stopped,
}

/// Statistics about the listener
#[derive(Debug, Clone, Default)]
pub struct ListenerStats {
    pub state: ListenerState,
    pub connected: bool,
    pub channels_listening: usize,
    pub events_received: u64,
    pub messages_inline: u64,
    pub messages_resolved: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub connection_errors: u64,
    pub last_event_at: Option<SystemTime>,
    pub last_error_at: Option<SystemTime>,
}

struct Subscription {
    channel: String,
    handler: Arc<dyn MessageHandler>,
}

enum Command {
    Subscribe {
        identifier: String,
        channel: String,
        handler: Arc<dyn MessageHandler>,
        ack: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        identifier: String,
        ack: oneshot::Sender<Result<()>>,
    },
}

/// Owns one dedicated LISTEN connection and the task that waits on it
pub struct NotificationListener {
    commands: mpsc::Sender<Command>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    stats: Arc<RwLock<ListenerStats>>,
}

impl std::fmt::Debug for NotificationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationListener")
            .field("stats", &*self.stats.read())
            .finish()
    }
}

impl NotificationListener {
    /// Open the dedicated connection and start waiting for notifications.
    ///
    /// Resolved messages are posted to `dispatch`; a message is always
    /// enqueued before the next wait begins.
    #[instrument(skip(connections, resolver, dispatch))]
    pub async fn start(
        connections: &ConnectionManager,
        identifier: &str,
        resolver: Arc<dyn Resolver>,
        dispatch: DispatchHandle,
    ) -> Result<Self> {
        let listener = connections.listen_connection(identifier).await?;

        let stats = Arc::new(RwLock::new(ListenerStats {
            connected: true,
            ..ListenerStats::default()
        }));
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (shutdown, shutdown_rx) = oneshot::channel();

        let worker = ListenerWorker {
            listener,
            resolver,
            dispatch,
            subscriptions: HashMap::new(),
            stats: Arc::clone(&stats),
        };
        let task = tokio::spawn(worker.run(command_rx, shutdown_rx));

        Ok(Self {
            commands,
            shutdown: Some(shutdown),
            task: Some(task),
            stats,
        })
    }

    /// LISTEN on `identifier` (if not already) and route its messages to
    /// `handler`, reporting `channel` as the channel name.
    pub async fn subscribe(
        &self,
        identifier: String,
        channel: String,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Subscribe {
            identifier,
            channel,
            handler,
            ack,
        })
        .await?;
        done.await.map_err(|_| RelayError::NotListening)?
    }

    /// Drop every handler for `identifier` and UNLISTEN
    pub async fn unsubscribe(&self, identifier: String) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Unsubscribe { identifier, ack }).await?;
        done.await.map_err(|_| RelayError::NotListening)?
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RelayError::NotListening)
    }

    /// Stop the loop and close the dedicated connection.
    ///
    /// A pending wait is abandoned immediately rather than waiting for one
    /// more notification.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Listener task failed");
            }
        }
        let mut stats = self.stats.write();
        stats.state = ListenerState::Stopped;
        stats.connected = false;
    }

    pub fn stats(&self) -> ListenerStats {
        self.stats.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// What the loop does after handling a notification
enum Flow {
    Continue,
    Stop,
}

/// State owned by the background task
struct ListenerWorker {
    listener: PgListener,
    resolver: Arc<dyn Resolver>,
    dispatch: DispatchHandle,
    subscriptions: HashMap<String, Vec<Subscription>>,
    stats: Arc<RwLock<ListenerStats>>,
}

impl ListenerWorker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        info!("Started listening for notifications");
        let mut backoff = INITIAL_RECONNECT_BACKOFF;

        loop {
            self.set_state(ListenerState::Listening);

            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                Some(command) = commands.recv() => self.handle_command(command).await,

                notification = self.listener.recv() => match notification {
                    Ok(notification) => {
                        backoff = INITIAL_RECONNECT_BACKOFF;
                        self.stats.write().connected = true;
                        if let Flow::Stop = self.handle_notification(notification, &mut shutdown).await {
                            break;
                        }
                    }
                    Err(e) => {
                        {
                            let mut stats = self.stats.write();
                            stats.connection_errors += 1;
                            stats.last_error_at = Some(SystemTime::now());
                            stats.connected = false;
                        }
                        error!(
                            retry_in_ms = backoff.as_millis() as u64,
                            "Connection error in listener: {}", e
                        );

                        // The next recv reconnects and re-issues LISTEN for every channel
                        tokio::select! {
                            biased;
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
                    }
                },
            }
        }

        self.set_state(ListenerState::Stopped);
        self.stats.write().connected = false;
        info!("Notification listener stopped");
        // Dropping the worker closes the dedicated connection
    }

    fn set_state(&self, state: ListenerState) {
        self.stats.write().state = state;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                identifier,
                channel,
                handler,
                ack,
            } => {
                let result = self.add_subscription(identifier, channel, handler).await;
                let _ = ack.send(result);
            }
            Command::Unsubscribe { identifier, ack } => {
                let result = self.remove_subscriptions(&identifier).await;
                let _ = ack.send(result);
            }
        }
    }

    async fn add_subscription(
        &mut self,
        identifier: String,
        channel: String,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if !self.subscriptions.contains_key(&identifier) {
            self.listener.listen(&identifier).await?;
            info!("Now listening to channel: {}", identifier);
        }

        self.subscriptions
            .entry(identifier)
            .or_default()
            .push(Subscription { channel, handler });
        self.stats.write().channels_listening = self.subscriptions.len();
        Ok(())
    }

    async fn remove_subscriptions(&mut self, identifier: &str) -> Result<()> {
        if self.subscriptions.remove(identifier).is_some() {
            self.listener.unlisten(identifier).await?;
            info!("Stopped listening to channel: {}", identifier);
        }
        self.stats.write().channels_listening = self.subscriptions.len();
        Ok(())
    }

    /// Resolve and enqueue one notification. Resolution failures drop the
    /// message; a closed dispatch loop or a shutdown request stops the loop.
    async fn handle_notification(
        &self,
        notification: PgNotification,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Flow {
        let identifier = notification.channel().to_string();
        debug!(
            "Received notification from channel: {} ({} bytes)",
            identifier,
            notification.payload().len()
        );
        {
            let mut stats = self.stats.write();
            stats.events_received += 1;
            stats.last_event_at = Some(SystemTime::now());
        }

        let Some(subscriptions) = self.subscriptions.get(&identifier) else {
            debug!("No subscribers for channel {}, ignoring", identifier);
            return Flow::Continue;
        };

        self.set_state(ListenerState::Resolving);
        let staged = notification.payload().starts_with(LARGE_PAYLOAD_PREFIX);
        let message = match self
            .resolver
            .resolve(notification.payload().to_string())
            .await
        {
            Ok(message) => {
                let mut stats = self.stats.write();
                if staged {
                    stats.messages_resolved += 1;
                } else {
                    stats.messages_inline += 1;
                }
                message
            }
            Err(e) => {
                {
                    let mut stats = self.stats.write();
                    stats.messages_dropped += 1;
                    stats.last_error_at = Some(SystemTime::now());
                }
                if e.is_message_scoped() {
                    warn!("Dropping notification on channel {}: {}", identifier, e);
                } else {
                    error!("Failed to resolve notification on channel {}: {}", identifier, e);
                }
                return Flow::Continue;
            }
        };

        self.set_state(ListenerState::Delivering);
        for subscription in subscriptions {
            self.stats.write().messages_delivered += 1;
            let delivery = Delivery {
                channel: subscription.channel.clone(),
                payload: message.clone(),
                handler: Arc::clone(&subscription.handler),
            };

            // A full queue behind a stuck handler must not block shutdown
            tokio::select! {
                biased;
                _ = &mut *shutdown => return Flow::Stop,
                posted = self.dispatch.post(delivery) => {
                    if posted.is_err() {
                        warn!("Dispatch loop closed, stopping listener");
                        return Flow::Stop;
                    }
                }
            }
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_stats() {
        let stats = ListenerStats::default();
        assert_eq!(stats.state, ListenerState::Idle);
        assert!(!stats.connected);
        assert_eq!(stats.channels_listening, 0);
        assert_eq!(stats.events_received, 0);
        assert_eq!(stats.messages_dropped, 0);
        assert_eq!(stats.messages_resolved, 0);
    }
}
