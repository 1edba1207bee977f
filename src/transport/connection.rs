//! Broker connection management.

use std::sync::Arc;

use tokio::time::Instant;

use crate::broker::{Broker, BrokerLink, QueueOptions};
use crate::config::BrokerConfig;
use crate::error::TransportError;

/// Owns the physical link to the broker for one producer or consumer.
///
/// `connect` establishes (or re-establishes) a link and declares the durable
/// task queue, retrying while the broker is unreachable until the
/// `connect_timeout` budget is exhausted. Unavailability within the budget is
/// not an error; exhausting it is.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    config: BrokerConfig,
    queue: String,
    link: Option<Arc<dyn BrokerLink>>,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, config: BrokerConfig, queue: impl Into<String>) -> Self {
        Self {
            broker,
            config,
            queue: queue.into(),
            link: None,
        }
    }

    /// Name of the durable task queue this connection declares.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The current link, if connected.
    pub fn link(&self) -> Option<&Arc<dyn BrokerLink>> {
        self.link.as_ref()
    }

    /// Connect to the broker and declare the durable task queue.
    ///
    /// Safe to call repeatedly; the queue declaration is idempotent. Fails
    /// with [`TransportError::ConnectionTimeout`] once the budget is spent,
    /// and immediately for non-retryable faults such as
    /// [`TransportError::QueueConflict`].
    pub async fn connect(&mut self) -> Result<Arc<dyn BrokerLink>, TransportError> {
        let started = Instant::now();
        loop {
            match self.try_connect().await {
                Ok(link) => {
                    tracing::debug!(queue = %self.queue, "Connected to broker");
                    self.link = Some(link.clone());
                    return Ok(link);
                }
                Err(e) if e.is_retryable() => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.config.connect_timeout {
                        tracing::warn!(
                            error = %e,
                            ?elapsed,
                            addr = %self.config.addr(),
                            "Broker connection budget exhausted"
                        );
                        return Err(TransportError::ConnectionTimeout {
                            elapsed,
                            budget: self.config.connect_timeout,
                        });
                    }
                    tracing::debug!(error = %e, "Broker unavailable, retrying");
                    tokio::time::sleep(self.config.retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_connect(&self) -> Result<Arc<dyn BrokerLink>, TransportError> {
        let link = self.broker.open().await?;
        match link.queue_declare(&self.queue, QueueOptions::durable()).await {
            Ok(_) => Ok(link),
            Err(e) => {
                // Leave nothing half-declared behind a failed connect.
                link.close().await;
                Err(e)
            }
        }
    }

    /// Delete the durable task queue.
    pub async fn delete_queue(&mut self) -> Result<(), TransportError> {
        let link = self.link.as_ref().ok_or_else(|| {
            TransportError::ChannelClosed("not connected to broker".to_string())
        })?;
        link.queue_delete(&self.queue).await
    }

    /// Drop the current link, closing it.
    pub async fn reset(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }
}
