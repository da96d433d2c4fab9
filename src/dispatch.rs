//! # Dispatch loop
//!
//! Subscriber callbacks run here, on their own task, in the order the
//! listener posted them. The listener only enqueues; a slow callback delays
//! later callbacks but never the next LISTEN wait.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};

/// Callback registered for a channel
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, channel: &str, payload: String);
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&str, String) + Send + Sync,
{
    async fn handle_message(&self, channel: &str, payload: String) {
        (self)(channel, payload)
    }
}

/// One unit of work posted by the listener
pub struct Delivery {
    pub channel: String,
    pub payload: String,
    pub handler: Arc<dyn MessageHandler>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("channel", &self.channel)
            .field("bytes", &self.payload.len())
            .finish()
    }
}

/// Cloneable handle used to post deliveries
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    sender: mpsc::Sender<Delivery>,
}

impl DispatchHandle {
    /// Enqueue a delivery, waiting for room if the queue is full
    pub async fn post(&self, delivery: Delivery) -> Result<()> {
        self.sender
            .send(delivery)
            .await
            .map_err(|_| RelayError::NotListening)
    }
}

/// Host event loop that invokes callbacks sequentially
#[derive(Debug)]
pub struct DispatchLoop {
    handle: DispatchHandle,
    task: JoinHandle<u64>,
}

impl DispatchLoop {
    /// Start the loop with a bounded queue
    pub fn spawn(buffer_size: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Delivery>(buffer_size.max(1));

        let task = tokio::spawn(async move {
            let mut dispatched = 0u64;
            while let Some(delivery) = receiver.recv().await {
                debug!(channel = %delivery.channel, "Dispatching message");
                delivery
                    .handler
                    .handle_message(&delivery.channel, delivery.payload)
                    .await;
                dispatched += 1;
            }
            info!(dispatched, "Dispatch loop stopped");
            dispatched
        });

        Self {
            handle: DispatchHandle { sender },
            task,
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Stop accepting work, run what is queued, and wait for the loop to end.
    ///
    /// Returns how many deliveries were run. Handles cloned from this loop
    /// must be dropped first or this waits for them.
    pub async fn shutdown(self) -> u64 {
        drop(self.handle);
        match self.task.await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                warn!(error = %e, "Dispatch loop task failed");
                0
            }
        }
    }
}
