// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Contract
//!
//! The resilience layer never speaks the wire protocol itself. It drives a
//! [`Transport`] that opens [`BrokerConnection`]s, which in turn hand out
//! [`BrokerChannel`]s. The lapin-backed implementation lives in
//! [`crate::amqp`]; tests substitute in-memory brokers.
//!
//! Lifecycle notifications are explicit: every connection and channel exposes a
//! `subscribe()` function returning a broadcast receiver of its transitions.
//! The supervisor and the registry consume these as plain event streams. They
//! subscribe first, so implementations back their streams with an [`EventHub`]
//! to keep what happened between creation and that first subscription.

use crate::{
    config::ClientProperties, errors::AmqpError, exchange::ExchangeDefinition,
    topology::QueueDeclaration,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::types::FieldTable;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::broadcast;

/// Capacity of the event buffers used by transport implementations.
pub const EVENT_BUFFER: usize = 32;

/// Broadcast of lifecycle events. The first subscriber also receives the
/// events sent before it subscribed; later subscribers only see what follows.
pub struct EventHub<E> {
    sender: broadcast::Sender<E>,
    first: Mutex<Option<broadcast::Receiver<E>>>,
}

impl<E: Clone> EventHub<E> {
    pub fn new() -> EventHub<E> {
        let (sender, first) = broadcast::channel(EVENT_BUFFER);
        EventHub {
            sender,
            first: Mutex::new(Some(first)),
        }
    }

    pub fn send(&self, event: E) {
        let _ = self.sender.send(event);
    }

    /// A sender for callbacks and tasks that outlive a borrow of the hub.
    pub fn sender(&self) -> broadcast::Sender<E> {
        self.sender.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| self.sender.subscribe())
    }
}

impl<E: Clone> Default for EventHub<E> {
    fn default() -> Self {
        EventHub::new()
    }
}

/// Transitions reported by a broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The broker applies flow control (memory or disk alarm).
    Blocked(String),
    /// The broker lifted flow control.
    Unblocked,
    /// The connection was closed by the broker or the network.
    Closed(Option<String>),
    /// The connection failed.
    Error(String),
}

/// Transitions reported by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Closed,
    Error(String),
    /// The write buffer went back under its high-water mark.
    Drain,
}

/// Properties attached to an outgoing message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishProperties {
    pub persistent: bool,
    pub priority: Option<u8>,
    pub expiration: Option<Duration>,
    pub headers: FieldTable,
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub headers: FieldTable,
    pub priority: Option<u8>,
    pub expiration: Option<String>,
}

/// Stream of deliveries for one consumer. It ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Opens connections to a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        uri: &str,
        properties: &ClientProperties,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// One network connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Receiver of the connection transitions. The first call also yields the
    /// ones that happened since the connection was opened.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A broker-scoped handle used for topology declarations and message I/O.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Publishes to an exchange.
    ///
    /// Returns `false` when the frame was not written because the local write
    /// buffer is over its high-water mark. The caller waits for
    /// [`ChannelEvent::Drain`] and publishes again.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<bool, AmqpError>;

    /// Places a message directly into a queue through the default exchange.
    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError>;

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Receiver of the channel transitions. The first call also yields the
    /// ones that happened since the channel was created.
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}
