//! In-process broker backend.
//!
//! Queues live in shared memory behind the same [`Broker`] seam a real
//! backend would implement. Competing consumers each get a pump task that
//! reserves capacity on a bounded channel before taking a message, which is
//! what enforces the prefetch limit: a worker that has not taken its previous
//! delivery blocks its pump from dequeuing another.
//!
//! The broker can be made unavailable ([`MemoryBroker::set_available`]) and
//! its links severed ([`MemoryBroker::kill_links`]) to exercise the
//! transport's retry and reconnect paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use uuid::Uuid;

use crate::broker::{Broker, BrokerLink, Delivery, QueueOptions};
use crate::error::TransportError;

struct QueueState {
    options: QueueOptions,
    /// Link that owns this queue, for exclusive queues.
    owner: Option<u64>,
    messages: VecDeque<Delivery>,
    notify: Arc<Notify>,
}

struct BrokerCore {
    queues: Mutex<HashMap<String, QueueState>>,
    /// Shutdown signal per open link, for fault injection.
    links: Mutex<HashMap<u64, Arc<watch::Sender<bool>>>>,
    available: AtomicBool,
    next_link_id: AtomicU64,
}

/// Shared in-process broker.
///
/// Clones share the same queues; every producer and consumer still opens its
/// own private link.
#[derive(Clone)]
pub struct MemoryBroker {
    core: Arc<BrokerCore>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            core: Arc::new(BrokerCore {
                queues: Mutex::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                next_link_id: AtomicU64::new(0),
            }),
        }
    }

    /// Gate link establishment. While unavailable, `open` fails with
    /// [`TransportError::ConnectionRefused`].
    pub fn set_available(&self, available: bool) {
        self.core.available.store(available, Ordering::SeqCst);
    }

    /// Sever every open link, as a broker crash would.
    ///
    /// Exclusive queues are destroyed with their owning links; durable
    /// queues and their buffered messages survive.
    pub async fn kill_links(&self) {
        let senders: Vec<_> = self.core.links.lock().await.drain().collect();
        for (id, closed) in senders {
            let _ = closed.send_replace(true);
            self.core.drop_exclusive_queues(id).await;
        }
        tracing::debug!("Severed all broker links");
    }

    /// Whether a queue currently exists.
    pub async fn has_queue(&self, name: &str) -> bool {
        self.core.queues.lock().await.contains_key(name)
    }

    /// Number of messages buffered in a queue.
    pub async fn queue_depth(&self, name: &str) -> Option<usize> {
        self.core
            .queues
            .lock()
            .await
            .get(name)
            .map(|q| q.messages.len())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open(&self) -> Result<Arc<dyn BrokerLink>, TransportError> {
        if !self.core.available.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionRefused(
                "broker unavailable".to_string(),
            ));
        }
        let id = self.core.next_link_id.fetch_add(1, Ordering::SeqCst);
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        self.core.links.lock().await.insert(id, closed.clone());
        tracing::trace!(link = id, "Opened broker link");
        Ok(Arc::new(MemoryLink {
            id,
            core: self.core.clone(),
            closed,
        }))
    }
}

impl BrokerCore {
    /// Remove the exclusive queues owned by a link, waking their consumers.
    async fn drop_exclusive_queues(&self, link_id: u64) {
        let mut queues = self.queues.lock().await;
        queues.retain(|_, state| {
            if state.owner == Some(link_id) {
                state.notify.notify_waiters();
                false
            } else {
                true
            }
        });
    }
}

struct MemoryLink {
    id: u64,
    core: Arc<BrokerCore>,
    closed: Arc<watch::Sender<bool>>,
}

impl MemoryLink {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if *self.closed.borrow() {
            Err(TransportError::ChannelClosed(
                "broker link is closed".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        self.ensure_open()?;
        let name = if name.is_empty() && options.exclusive {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };

        let mut queues = self.core.queues.lock().await;
        if let Some(existing) = queues.get(&name) {
            if existing.options != options {
                return Err(TransportError::QueueConflict {
                    name,
                    detail: format!(
                        "declared durable={} exclusive={}, exists with durable={} exclusive={}",
                        options.durable,
                        options.exclusive,
                        existing.options.durable,
                        existing.options.exclusive
                    ),
                });
            }
            if existing.options.exclusive && existing.owner != Some(self.id) {
                return Err(TransportError::QueueConflict {
                    name,
                    detail: "exclusive queue is owned by another connection".to_string(),
                });
            }
            return Ok(name);
        }

        queues.insert(
            name.clone(),
            QueueState {
                options,
                owner: options.exclusive.then_some(self.id),
                messages: VecDeque::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        tracing::trace!(queue = %name, ?options, "Declared queue");
        Ok(name)
    }

    async fn queue_delete(&self, name: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut queues = self.core.queues.lock().await;
        match queues.remove(name) {
            Some(state) => {
                // Wake consumer pumps so they observe the deletion and stop.
                state.notify.notify_waiters();
                tracing::trace!(queue = %name, "Deleted queue");
                Ok(())
            }
            None => Err(TransportError::UnknownQueue(name.to_string())),
        }
    }

    async fn publish(&self, queue: &str, delivery: Delivery) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut queues = self.core.queues.lock().await;
        // Publishing to a queue that no longer exists drops the message,
        // matching fire-and-forget broker semantics.
        if let Some(state) = queues.get_mut(queue) {
            state.messages.push_back(delivery);
            state.notify.notify_one();
        } else {
            tracing::trace!(queue = %queue, "Dropped publish to missing queue");
        }
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, TransportError> {
        self.ensure_open()?;
        let mut queues = self.core.queues.lock().await;
        match queues.get_mut(queue) {
            Some(state) => Ok(state.messages.pop_front()),
            None => Err(TransportError::UnknownQueue(queue.to_string())),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        self.ensure_open()?;
        if !self.core.queues.lock().await.contains_key(queue) {
            return Err(TransportError::UnknownQueue(queue.to_string()));
        }
        let (tx, rx) = mpsc::channel(prefetch.max(1));
        tokio::spawn(pump(
            self.core.clone(),
            queue.to_string(),
            tx,
            self.closed.subscribe(),
        ));
        Ok(rx)
    }

    async fn close(&self) {
        let _ = self.closed.send_replace(true);
        self.core.links.lock().await.remove(&self.id);
        self.core.drop_exclusive_queues(self.id).await;
        tracing::trace!(link = self.id, "Closed broker link");
    }
}

/// Per-consumer delivery pump.
///
/// Reserves channel capacity before dequeuing, so a message is only taken
/// off the shared queue once this consumer can hold it — the dequeue is the
/// acknowledgement.
async fn pump(
    core: Arc<BrokerCore>,
    queue: String,
    tx: mpsc::Sender<Delivery>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        if *closed.borrow() {
            return;
        }
        let permit = tokio::select! {
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                // Consumer side dropped.
                Err(_) => return,
            },
            _ = closed.changed() => return,
        };

        loop {
            let notify = {
                let mut queues = core.queues.lock().await;
                let Some(state) = queues.get_mut(&queue) else {
                    // Queue deleted; end the delivery stream.
                    return;
                };
                if let Some(delivery) = state.messages.pop_front() {
                    permit.send(delivery);
                    break;
                }
                state.notify.clone()
            };
            tokio::select! {
                _ = notify.notified() => {}
                _ = closed.changed() => return,
            }
        }
    }
}
