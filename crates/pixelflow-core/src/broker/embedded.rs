//! In-process broker with AMQP 0-9-1 style semantics.
//!
//! - Connections own channels; channels are cheap and never shared between
//!   concurrent consumers.
//! - Auto-delete queues and exchanges belong to the connection that declared
//!   them and disappear when it closes.
//! - Each channel has a prefetch limit: a consumer holds at most that many
//!   unsettled deliveries.
//! - A delivery dropped without `ack`/`nack` is requeued and flagged as
//!   redelivered, which gives at-least-once delivery.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use super::{Destination, ExchangeKind, Message, Publisher, QueueOptions};
use crate::error::BrokerError;

/// Shared handle to one broker instance.
#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    next_connection: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Arc<QueueState>>,
    exchanges: HashMap<String, ExchangeState>,
}

struct ExchangeState {
    kind: ExchangeKind,
    owner: Option<u64>,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

struct Envelope {
    message: Message,
    redelivered: bool,
}

struct QueueState {
    name: String,
    options: QueueOptions,
    owner: Option<u64>,
    ready: Mutex<VecDeque<Envelope>>,
    unacked: AtomicUsize,
    deleted: AtomicBool,
    notify: Notify,
}

impl QueueState {
    fn push_back(&self, envelope: Envelope) {
        if self.deleted.load(Ordering::Acquire) {
            return;
        }
        lock(&self.ready).push_back(envelope);
        self.notify.notify_one();
    }

    fn push_front(&self, envelope: Envelope) {
        if self.deleted.load(Ordering::Acquire) {
            return;
        }
        lock(&self.ready).push_front(envelope);
        self.notify.notify_one();
    }

    /// Take the next message, counting it as unacknowledged under the same lock
    /// so depth never reads as drained while a message is in hand.
    fn pop(&self) -> Option<Envelope> {
        let mut ready = lock(&self.ready);
        let envelope = ready.pop_front();
        if envelope.is_some() {
            self.unacked.fetch_add(1, Ordering::AcqRel);
        }
        // Hand the wakeup on so a second idle consumer sees remaining work.
        if envelope.is_some() && !ready.is_empty() {
            self.notify.notify_one();
        }
        envelope
    }

    fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
        lock(&self.ready).clear();
        self.notify.notify_waiters();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection.
    pub fn connect(&self) -> Connection {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!("Broker connection {} opened", id);
        Connection {
            inner: Arc::new(ConnectionInner {
                id,
                broker: self.clone(),
                closed: AtomicBool::new(false),
                closed_notify: Notify::new(),
            }),
        }
    }

    /// Ready + unacknowledged message counts for a queue.
    pub fn queue_depth(&self, name: &str) -> Option<(usize, usize)> {
        let state = lock(&self.inner.state);
        state.queues.get(name).map(|queue| {
            (
                lock(&queue.ready).len(),
                queue.unacked.load(Ordering::Acquire),
            )
        })
    }

    fn queue(&self, name: &str) -> Option<Arc<QueueState>> {
        lock(&self.inner.state).queues.get(name).cloned()
    }

    fn release_owned(&self, connection: u64) {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;
        let owned: Vec<String> = state
            .queues
            .values()
            .filter(|queue| queue.owner == Some(connection))
            .map(|queue| queue.name.clone())
            .collect();
        for name in owned {
            if let Some(queue) = state.queues.remove(&name) {
                queue.mark_deleted();
                tracing::debug!("Auto-deleted queue {}", name);
            }
        }
        state
            .exchanges
            .retain(|_, exchange| exchange.owner != Some(connection));
        let queues = &state.queues;
        for exchange in state.exchanges.values_mut() {
            exchange
                .bindings
                .retain(|(queue, _)| queues.contains_key(queue));
        }
    }
}

struct ConnectionInner {
    id: u64,
    broker: Broker,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl ConnectionInner {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BrokerError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

/// A broker connection. Closing it (explicitly or by dropping) removes every
/// auto-delete queue and exchange it declared.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Open a channel on this connection.
    pub fn channel(&self) -> Result<Channel, BrokerError> {
        self.inner.ensure_open()?;
        Ok(Channel {
            connection: Arc::clone(&self.inner),
            prefetch: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
        })
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.broker.release_owned(self.inner.id);
        self.inner.closed_notify.notify_waiters();
        tracing::debug!("Broker connection {} closed", self.inner.id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// A lightweight channel. Publishing, declaring, and consuming go through it.
pub struct Channel {
    connection: Arc<ConnectionInner>,
    prefetch: Arc<Semaphore>,
}

impl Channel {
    fn broker(&self) -> &Broker {
        &self.connection.broker
    }

    /// Limit the number of unsettled deliveries on this channel.
    ///
    /// Must be called before `basic_consume`; 0 means unlimited.
    pub fn basic_qos(&mut self, prefetch: u16) {
        let permits = if prefetch == 0 {
            Semaphore::MAX_PERMITS
        } else {
            usize::from(prefetch)
        };
        self.prefetch = Arc::new(Semaphore::new(permits));
    }

    /// Declare a queue, creating it if needed. Re-declaring with the same
    /// options is a no-op.
    pub fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.connection.ensure_open()?;
        let mut state = lock(&self.broker().inner.state);
        if let Some(existing) = state.queues.get(name) {
            if existing.options != options {
                return Err(BrokerError::PreconditionFailed {
                    name: name.to_string(),
                    message: format!(
                        "declared with {:?}, requested {:?}",
                        existing.options, options
                    ),
                });
            }
            return Ok(());
        }
        let owner = options.auto_delete.then_some(self.connection.id);
        state.queues.insert(
            name.to_string(),
            Arc::new(QueueState {
                name: name.to_string(),
                options,
                owner,
                ready: Mutex::new(VecDeque::new()),
                unacked: AtomicUsize::new(0),
                deleted: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        );
        tracing::debug!("Declared queue {} ({:?})", name, options);
        Ok(())
    }

    /// Check that a queue exists without creating it.
    pub fn queue_declare_passive(&self, name: &str) -> Result<(), BrokerError> {
        self.connection.ensure_open()?;
        if self.broker().queue(name).is_some() {
            Ok(())
        } else {
            Err(BrokerError::QueueNotFound(name.to_string()))
        }
    }

    /// Delete a queue. Deleting a missing queue succeeds.
    pub fn queue_delete(&self, name: &str) -> Result<(), BrokerError> {
        self.connection.ensure_open()?;
        let mut state = lock(&self.broker().inner.state);
        if let Some(queue) = state.queues.remove(name) {
            queue.mark_deleted();
        }
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
        Ok(())
    }

    pub fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        auto_delete: bool,
    ) -> Result<(), BrokerError> {
        self.connection.ensure_open()?;
        let mut state = lock(&self.broker().inner.state);
        if let Some(existing) = state.exchanges.get(name) {
            if existing.kind != kind {
                return Err(BrokerError::PreconditionFailed {
                    name: name.to_string(),
                    message: format!("declared as {:?}, requested {:?}", existing.kind, kind),
                });
            }
            return Ok(());
        }
        state.exchanges.insert(
            name.to_string(),
            ExchangeState {
                kind,
                owner: auto_delete.then_some(self.connection.id),
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn exchange_declare_passive(&self, name: &str) -> Result<(), BrokerError> {
        self.connection.ensure_open()?;
        if lock(&self.broker().inner.state).exchanges.contains_key(name) {
            Ok(())
        } else {
            Err(BrokerError::ExchangeNotFound(name.to_string()))
        }
    }

    pub fn exchange_delete(&self, name: &str) -> Result<(), BrokerError> {
        self.connection.ensure_open()?;
        lock(&self.broker().inner.state).exchanges.remove(name);
        Ok(())
    }

    pub fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.connection.ensure_open()?;
        let mut state = lock(&self.broker().inner.state);
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let exchange_state = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    /// Start consuming from a queue under this channel's prefetch limit.
    pub fn basic_consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        self.connection.ensure_open()?;
        let queue = self
            .broker()
            .queue(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        Ok(Consumer {
            queue,
            connection: Arc::clone(&self.connection),
            prefetch: Arc::clone(&self.prefetch),
        })
    }

    fn route(&self, destination: &Destination) -> Result<Vec<Arc<QueueState>>, BrokerError> {
        let state = lock(&self.broker().inner.state);
        match destination {
            Destination::Queue(name) => state
                .queues
                .get(name)
                .cloned()
                .map(|queue| vec![queue])
                .ok_or_else(|| BrokerError::QueueNotFound(name.clone())),
            Destination::Exchange { name, routing_key } => {
                let exchange = state
                    .exchanges
                    .get(name)
                    .ok_or_else(|| BrokerError::ExchangeNotFound(name.clone()))?;
                Ok(exchange
                    .bindings
                    .iter()
                    .filter(|(_, key)| match exchange.kind {
                        ExchangeKind::Fanout => true,
                        ExchangeKind::Direct => key == routing_key,
                    })
                    .filter_map(|(queue, _)| state.queues.get(queue).cloned())
                    .collect())
            }
        }
    }
}

#[async_trait]
impl Publisher for Channel {
    async fn publish(&self, destination: &Destination, message: Message) -> Result<(), BrokerError> {
        self.connection.ensure_open()?;
        let targets = self.route(destination)?;
        if targets.is_empty() {
            tracing::debug!("Unroutable message to {:?} dropped", destination);
        }
        for queue in targets {
            queue.push_back(Envelope {
                message: message.clone(),
                redelivered: false,
            });
        }
        Ok(())
    }
}

/// Receives deliveries from one queue.
pub struct Consumer {
    queue: Arc<QueueState>,
    connection: Arc<ConnectionInner>,
    prefetch: Arc<Semaphore>,
}

impl Consumer {
    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    /// Wait for the next delivery.
    ///
    /// Blocks while the prefetch window is full. Returns `None` once the
    /// queue is deleted or the connection is closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        if self.connection.closed.load(Ordering::Acquire) {
            return None;
        }
        let permit = tokio::select! {
            permit = Arc::clone(&self.prefetch).acquire_owned() => permit.ok()?,
            _ = self.connection.closed_notify.notified() => return None,
        };
        loop {
            let notified = self.queue.notify.notified();
            let closed = self.connection.closed_notify.notified();
            if self.connection.closed.load(Ordering::Acquire)
                || self.queue.deleted.load(Ordering::Acquire)
            {
                return None;
            }
            if let Some(envelope) = self.queue.pop() {
                return Some(Delivery {
                    message: envelope.message,
                    redelivered: envelope.redelivered,
                    settled: false,
                    queue: Arc::clone(&self.queue),
                    _permit: permit,
                });
            }
            tokio::select! {
                _ = notified => {}
                _ = closed => {}
            }
        }
    }
}

/// A message handed to a consumer and not yet settled.
pub struct Delivery {
    message: Message,
    redelivered: bool,
    settled: bool,
    queue: Arc<QueueState>,
    _permit: OwnedSemaphorePermit,
}

impl Delivery {
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// True when this message was delivered before and not settled.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Positive acknowledgement: the message is removed.
    pub fn ack(mut self) {
        self.settle(false);
    }

    /// Negative acknowledgement, optionally putting the message back.
    pub fn nack(mut self, requeue: bool) {
        self.settle(requeue);
    }

    fn settle(&mut self, requeue: bool) {
        if self.settled {
            return;
        }
        self.settled = true;
        if requeue {
            self.queue.push_front(Envelope {
                message: std::mem::take(&mut self.message),
                redelivered: true,
            });
        }
        self.queue.unacked.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.settle(true);
    }
}
