//! Producer side: publish a task, drain its response stream.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::broker::{Broker, BrokerLink, Delivery, QueueOptions};
use crate::config::BrokerConfig;
use crate::error::{Error, Result, TransportError};
use crate::transport::connection::ConnectionManager;
use crate::wire;

/// Sends task requests on the durable queue and collects the streamed
/// responses from a per-request reply channel.
///
/// One outstanding request at a time: `send` replaces the previous reply
/// channel and clears any stored metadata.
pub struct Producer {
    conn: ConnectionManager,
    reply_queue: Option<String>,
    metadata: Option<Value>,
    drained: bool,
}

impl Producer {
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
            reply_queue: None,
            metadata: None,
            drained: false,
        })
    }

    /// Publish a task request. Returns as soon as the message is on the
    /// queue; drain [`receive`](Self::receive) for the results.
    ///
    /// A fresh exclusive reply channel is declared before the message is
    /// published, and its name travels with the message. No deduplication is
    /// performed — re-sending is the caller's decision.
    pub async fn send<T: Serialize + ?Sized>(&mut self, payload: &T) -> Result<()> {
        let body = wire::encode(payload)?;
        let link = self.require_link()?.clone();

        let reply = link.queue_declare("", QueueOptions::exclusive()).await?;
        self.metadata = None;
        self.drained = false;

        link.publish(
            self.conn.queue_name(),
            Delivery {
                body,
                reply_to: Some(reply.clone()),
                persistent: true,
            },
        )
        .await?;
        tracing::debug!(queue = %self.conn.queue_name(), reply = %reply, "Published task");
        self.reply_queue = Some(reply);
        Ok(())
    }

    /// The response stream for the outstanding request.
    ///
    /// Lazy: nothing is read until [`ResponseStream::next`] is called. Once
    /// the stream has been drained past the sentinel, further calls return a
    /// stream that is already finished.
    pub fn receive(&mut self) -> ResponseStream<'_> {
        let state = if self.drained || self.reply_queue.is_none() {
            StreamState::Done
        } else {
            StreamState::AwaitingData
        };
        ResponseStream {
            producer: self,
            state,
        }
    }

    /// Run metadata from the last fully drained response stream.
    ///
    /// `None` until a stream has been consumed past the sentinel.
    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    /// Delete the durable task queue.
    pub async fn delete_queue(&mut self) -> std::result::Result<(), TransportError> {
        self.conn.delete_queue().await
    }

    /// Close the broker link. The reply channel dies with it.
    pub async fn close(&mut self) {
        self.reply_queue = None;
        self.conn.reset().await;
    }

    fn require_link(&self) -> std::result::Result<&Arc<dyn BrokerLink>, TransportError> {
        self.conn
            .link()
            .ok_or_else(|| TransportError::ChannelClosed("producer is not connected".to_string()))
    }
}

enum StreamState {
    /// Waiting for the next reply to arrive.
    AwaitingData,
    /// A decoded payload is ready to be yielded.
    DataReady(Value),
    /// Sentinel seen; exactly one metadata value is still owed.
    AwaitingMetadata,
    /// Finished. Either drained past the metadata or stopped early.
    Done,
}

/// Lazy, ordered, finite stream of response payloads.
///
/// Yields each value published before the `END` sentinel, then reads the
/// metadata value that follows it, stores that on the [`Producer`], and
/// finishes. Dropping the stream before the sentinel stops it early and
/// leaves the metadata unset.
///
/// The producer does not reconnect mid-stream: a broker fault fails `next`
/// with a [`TransportError`] and the caller decides whether to start over
/// with a new producer.
pub struct ResponseStream<'a> {
    producer: &'a mut Producer,
    state: StreamState,
}

impl ResponseStream<'_> {
    /// Pull the next response payload, blocking (polling the reply channel)
    /// until one arrives. `Ok(None)` means the stream is exhausted.
    pub async fn next(&mut self) -> Result<Option<Value>> {
        loop {
            match std::mem::replace(&mut self.state, StreamState::Done) {
                StreamState::Done => return Ok(None),
                StreamState::AwaitingData => {
                    let body = self.pull().await?;
                    if wire::is_end_of_stream(&body) {
                        self.state = StreamState::AwaitingMetadata;
                    } else {
                        self.state = StreamState::DataReady(wire::decode(&body)?);
                    }
                }
                StreamState::DataReady(value) => {
                    self.state = StreamState::AwaitingData;
                    return Ok(Some(value));
                }
                StreamState::AwaitingMetadata => {
                    let body = self.pull().await?;
                    let metadata = wire::decode_metadata(&body)?;
                    tracing::debug!(%metadata, "Response stream complete");
                    self.producer.metadata = Some(metadata);
                    self.producer.drained = true;
                    return Ok(None);
                }
            }
        }
    }

    /// Drain the remaining payloads into a vector.
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await? {
            values.push(value);
        }
        Ok(values)
    }

    /// Poll the reply channel until a message is waiting.
    async fn pull(&mut self) -> Result<Vec<u8>> {
        let link = self.producer.require_link()?.clone();
        let queue = self
            .producer
            .reply_queue
            .clone()
            .ok_or_else(|| TransportError::ChannelClosed("no outstanding request".to_string()))
            .map_err(Error::from)?;
        let interval = self.producer.conn.config().reply_poll_interval;
        loop {
            match link.get(&queue).await.map_err(Error::from)? {
                Some(delivery) => return Ok(delivery.body),
                None => tokio::time::sleep(interval).await,
            }
        }
    }
}
