//! Consumer side: the worker loop that drains the durable task queue.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::broker::{Broker, BrokerLink, Delivery};
use crate::config::BrokerConfig;
use crate::error::{Result, TransportError};
use crate::transport::connection::ConnectionManager;
use crate::wire;

/// Handles one task at a time.
///
/// The handler may call the responder zero or more times and is expected to
/// eventually call [`Responder::finish`] (or publish the sentinel itself) so
/// the producer's stream terminates. The loop does not enforce this: a
/// handler that never finishes leaves the matching producer blocked.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Value, responder: Responder) -> Result<()>;
}

/// Capability for answering one specific task.
///
/// Bound to the reply channel named in the task message. Tasks sent without
/// a reply channel get a responder that drops replies.
#[derive(Clone)]
pub struct Responder {
    link: Arc<dyn BrokerLink>,
    reply_to: Option<String>,
}

impl Responder {
    /// Publish one reply value to the task's reply channel.
    pub async fn send<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let body = wire::encode(value)?;
        self.publish(body).await
    }

    /// Terminate the response stream: publish the sentinel, then the
    /// metadata value the producer stores after draining.
    pub async fn finish<T: Serialize + ?Sized>(&self, metadata: &T) -> Result<()> {
        let body = wire::encode(metadata)?;
        self.publish(wire::END_OF_STREAM.to_vec()).await?;
        self.publish(body).await
    }

    async fn publish(&self, body: Vec<u8>) -> Result<()> {
        let Some(reply_to) = &self.reply_to else {
            tracing::trace!("Task carries no reply channel, dropping response");
            return Ok(());
        };
        self.link
            .publish(
                reply_to,
                Delivery {
                    body,
                    reply_to: None,
                    persistent: false,
                },
            )
            .await?;
        Ok(())
    }
}

/// Where the worker loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Subscribed,
    Handling,
    /// Terminal: an exclusive consumer observed its channel closing.
    Stopped,
}

/// Worker-side consumer of the durable task queue.
///
/// Pulls at most one unacknowledged task at a time (prefetch = 1) and
/// acknowledges at dequeue: a handler crash drops the task rather than
/// requeuing it.
pub struct Consumer {
    conn: ConnectionManager,
    exclusive: bool,
    state: ConsumerState,
}

impl Consumer {
    /// Connect to the broker and declare the durable task queue.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        config: BrokerConfig,
        queue: impl Into<String>,
    ) -> std::result::Result<Self, TransportError> {
        let mut conn = ConnectionManager::new(broker, config, queue);
        conn.connect().await?;
        Ok(Self {
            conn,
            exclusive: false,
            state: ConsumerState::Disconnected,
        })
    }

    /// Mark this consumer as exclusive: when its channel closes it returns
    /// instead of reconnecting, so ephemeral workers clean up on their own.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Consume tasks until the process stops.
    ///
    /// Transport faults trigger a reconnect through the same bounded
    /// `connect()` used everywhere else; its [`TransportError::ConnectionTimeout`]
    /// propagates to the supervisor, which decides whether to restart the
    /// loop. Exclusive consumers instead return `Ok(())` when their channel
    /// closes. Malformed task bodies are data errors: logged, skipped, and
    /// never treated as connectivity.
    pub async fn consume_forever(
        &mut self,
        handler: Arc<dyn TaskHandler>,
    ) -> std::result::Result<(), TransportError> {
        loop {
            let link = match self.conn.link() {
                Some(link) => link.clone(),
                None => {
                    self.state = ConsumerState::Connecting;
                    self.conn.connect().await?
                }
            };

            let mut deliveries = match link.consume(self.conn.queue_name(), 1).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    if self.exclusive {
                        tracing::debug!(error = %e, "Exclusive consumer stopping");
                        self.state = ConsumerState::Stopped;
                        return Ok(());
                    }
                    tracing::warn!(error = %e, "Subscribe failed, reconnecting");
                    self.conn.reset().await;
                    self.state = ConsumerState::Disconnected;
                    continue;
                }
            };
            self.state = ConsumerState::Subscribed;
            tracing::debug!(queue = %self.conn.queue_name(), "Subscribed to task queue");

            while let Some(delivery) = deliveries.recv().await {
                self.state = ConsumerState::Handling;
                self.dispatch(&link, delivery, handler.as_ref()).await;
                self.state = ConsumerState::Subscribed;
            }

            // The delivery stream only ends when the link dies or the queue
            // is deleted.
            if self.exclusive {
                tracing::debug!("Exclusive consumer channel closed, stopping");
                self.state = ConsumerState::Stopped;
                return Ok(());
            }
            tracing::warn!(queue = %self.conn.queue_name(), "Lost broker link, reconnecting");
            self.conn.reset().await;
            self.state = ConsumerState::Disconnected;
        }
    }

    async fn dispatch(&self, link: &Arc<dyn BrokerLink>, delivery: Delivery, handler: &dyn TaskHandler) {
        let task: Value = match wire::decode(&delivery.body) {
            Ok(task) => task,
            Err(e) => {
                // Already acknowledged at dequeue; nothing to requeue.
                tracing::warn!(error = %e, "Discarding malformed task payload");
                return;
            }
        };
        let responder = Responder {
            link: link.clone(),
            reply_to: delivery.reply_to,
        };
        if let Err(e) = handler.handle(task, responder).await {
            tracing::warn!(error = %e, "Task handler failed");
        }
    }

    /// Delete the durable task queue (worker teardown, temporary queues).
    pub async fn delete_queue(&mut self) -> std::result::Result<(), TransportError> {
        self.conn.delete_queue().await
    }

    /// Close the broker link.
    pub async fn close(&mut self) {
        self.conn.reset().await;
        self.state = ConsumerState::Disconnected;
    }
}
