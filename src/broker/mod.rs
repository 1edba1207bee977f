//! Broker abstraction — the pub/sub seam the transport is built on.
//!
//! A [`Broker`] opens [`BrokerLink`]s: live channels that can declare and
//! delete queues, publish, fetch single messages, and subscribe with a
//! prefetch limit. The transport layer builds request/response correlation
//! and multi-reply streaming on top of these primitives; the broker itself
//! offers neither.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub use memory::MemoryBroker;

/// A message as it travels through a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Serialized payload.
    pub body: Vec<u8>,
    /// Name of the reply channel for this task, if any.
    pub reply_to: Option<String>,
    /// Whether the message should survive a broker restart.
    pub persistent: bool,
}

/// Properties a queue is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Queue survives broker restarts.
    pub durable: bool,
    /// Queue is private to the declaring link and destroyed when that link
    /// closes. Declared with an empty name to get a server-generated one.
    pub exclusive: bool,
}

impl QueueOptions {
    /// A durable, named work queue.
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
        }
    }

    /// An exclusive, ephemeral reply queue.
    pub fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
        }
    }
}

/// A factory for broker links.
///
/// `open` fails with [`TransportError::ConnectionRefused`] while the broker
/// is unreachable; the connection manager retries that within its budget.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new link to the broker.
    async fn open(&self) -> Result<Arc<dyn BrokerLink>, TransportError>;
}

/// A live channel to the broker.
///
/// Owned by exactly one producer or consumer instance; never shared across
/// instances.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Declare a queue, returning its name.
    ///
    /// Idempotent for matching properties; a queue declared with different
    /// properties yields [`TransportError::QueueConflict`]. An exclusive
    /// declaration with an empty name returns a server-generated name.
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError>;

    /// Delete a queue and everything buffered in it.
    async fn queue_delete(&self, name: &str) -> Result<(), TransportError>;

    /// Publish one message to a queue. Fire-and-forget.
    async fn publish(&self, queue: &str, delivery: Delivery) -> Result<(), TransportError>;

    /// Non-blocking fetch of the next message, if one is waiting.
    ///
    /// The message is acknowledged by the fetch itself.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, TransportError>;

    /// Subscribe to a queue with at most `prefetch` unacknowledged
    /// deliveries in flight.
    ///
    /// Messages are acknowledged at dequeue. The stream ends when the link
    /// closes or the queue is deleted.
    async fn consume(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError>;

    /// Close the link, destroying any exclusive queues it owns.
    async fn close(&self);
}
