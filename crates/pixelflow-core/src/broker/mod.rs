//! Message broker primitives.
//!
//! Stages only see [`Message`], [`Destination`], and the [`Publisher`] trait.
//! The [`embedded`] module provides an in-process AMQP-style broker with
//! queues, fan-out/direct exchanges, per-channel prefetch, and redelivery of
//! unsettled deliveries.

pub mod embedded;

pub use embedded::{Broker, Channel, Connection, Consumer, Delivery};

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::BrokerError;

/// A broker message: string headers plus an opaque body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            headers: BTreeMap::new(),
            body,
        }
    }

    /// Builder-style header insertion.
    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Where a message is published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Directly to a queue (default exchange)
    Queue(String),
    /// To an exchange, routed by its bindings
    Exchange { name: String, routing_key: String },
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue(name.into())
    }

    pub fn exchange(name: impl Into<String>) -> Self {
        Destination::Exchange {
            name: name.into(),
            routing_key: String::new(),
        }
    }
}

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Every bound queue receives a copy
    Fanout,
    /// Bound queues whose binding key equals the routing key
    Direct,
}

/// Queue lifecycle options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives broker restarts
    pub durable: bool,
    /// Deleted when the declaring connection closes
    pub auto_delete: bool,
}

impl QueueOptions {
    pub const DURABLE: QueueOptions = QueueOptions {
        durable: true,
        auto_delete: false,
    };

    pub const TRANSIENT: QueueOptions = QueueOptions {
        durable: false,
        auto_delete: true,
    };
}

/// Anything that can put a message onto the broker.
///
/// Uses `async_trait` because stages hold publishers as `Arc<dyn Publisher>`.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, destination: &Destination, message: Message) -> Result<(), BrokerError>;
}
