// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Publisher
//!
//! A [`Publisher`] sends JSON messages to one routing key of the connection's
//! exchange. Publishing survives broker outages: the publisher waits out flow
//! control, reloads its channel after failures and, when the local write
//! buffer is full, waits for the channel to drain before trying again.
//!
//! Messages that still cannot be published are either reported to the caller
//! or kept in the connection's fallback store, depending on the
//! [`UndeliverablePolicy`].

use crate::{
    connection::Connection,
    errors::AmqpError,
    fallback::ReplayTarget,
    message::{Message, PublishResult},
    otel,
    transport::{ChannelEvent, PublishProperties},
};
use async_trait::async_trait;
use lapin::types::FieldTable;
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time,
};
use tracing::{debug, error, warn};

/// Name of the cached channel shared by every publisher of a connection.
pub const PUBLISHER_CHANNEL: &str = "publisher";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// What a publisher does with a message it could not deliver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UndeliverablePolicy {
    /// Return the error to the caller.
    #[default]
    Raise,
    /// Keep the message in the fallback store for replay.
    Buffer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherOptions {
    pub persistent: bool,
    /// `None` retries until the connection is closed.
    pub max_attempts: Option<u32>,
    pub drain_timeout: Duration,
    pub undeliverable: UndeliverablePolicy,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        PublisherOptions {
            persistent: false,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            undeliverable: UndeliverablePolicy::Raise,
        }
    }
}

/// State shared by every handle of the publisher registered for a topic.
pub(crate) struct PublisherShared {
    topic: String,
    options: RwLock<PublisherOptions>,
}

impl PublisherShared {
    pub(crate) fn new(topic: &str) -> PublisherShared {
        PublisherShared {
            topic: topic.to_owned(),
            options: RwLock::new(PublisherOptions::default()),
        }
    }
}

/// Publishes messages to one topic. Obtained from [`Connection::topic`].
#[derive(Clone)]
pub struct Publisher {
    connection: Connection,
    shared: Arc<PublisherShared>,
}

impl Publisher {
    pub(crate) fn new(connection: Connection, shared: Arc<PublisherShared>) -> Publisher {
        Publisher { connection, shared }
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn options(&self) -> PublisherOptions {
        self.shared
            .options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(self, change: impl FnOnce(&mut PublisherOptions)) -> Self {
        change(
            &mut self
                .shared
                .options
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        self
    }

    /// Marks messages as persistent so durable queues keep them across restarts.
    pub fn persistent(self, persistent: bool) -> Self {
        self.update(|o| o.persistent = persistent)
    }

    pub fn max_attempts(self, attempts: u32) -> Self {
        self.update(|o| o.max_attempts = Some(attempts))
    }

    pub fn unbounded_attempts(self) -> Self {
        self.update(|o| o.max_attempts = None)
    }

    pub fn drain_timeout(self, timeout: Duration) -> Self {
        self.update(|o| o.drain_timeout = timeout)
    }

    pub fn undeliverable(self, policy: UndeliverablePolicy) -> Self {
        self.update(|o| o.undeliverable = policy)
    }

    /// Serializes `payload` and sends it.
    pub async fn send_json<T: Serialize>(&self, payload: &T) -> Result<PublishResult, AmqpError> {
        self.send(Message::new(payload)?).await
    }

    /// Sends a message, retrying through outages.
    ///
    /// With [`UndeliverablePolicy::Buffer`] the message goes to the fallback
    /// store when the connection is down or every attempt failed.
    pub async fn send(&self, message: Message) -> Result<PublishResult, AmqpError> {
        let options = self.options();

        if options.undeliverable == UndeliverablePolicy::Buffer && !self.connection_available().await {
            debug!(topic = self.topic(), "connection unavailable, buffering message");
            return Ok(self.connection.store_fallback(self.topic(), message).await);
        }

        match self.deliver_with(&message, &options).await {
            Ok(()) => Ok(PublishResult::Delivered),
            Err(err) if err.is_configuration() => Err(err),
            Err(err) => match options.undeliverable {
                UndeliverablePolicy::Raise => Err(err),
                UndeliverablePolicy::Buffer => {
                    warn!(error = err.to_string(), topic = self.topic(), "buffering undeliverable message");
                    Ok(self.connection.store_fallback(self.topic(), message).await)
                }
            },
        }
    }

    /// Gives a connection that is still starting up one connect timeout to come up.
    async fn connection_available(&self) -> bool {
        if self.connection.is_connected() {
            return true;
        }

        self.connection.start();
        let wait = self.connection.config().connect_timeout;
        let up = self
            .connection
            .wait_for_state(|state| state.is_up() || state.is_terminal());

        matches!(time::timeout(wait, up).await, Ok(state) if state.is_up())
    }

    async fn deliver_with(&self, message: &Message, options: &PublisherOptions) -> Result<(), AmqpError> {
        let payload = message.encode()?;
        let exchange = self.connection.exchange_name().to_owned();
        let retry_interval = self.connection.config().publish_retry_interval;
        let mut attempts: u32 = 0;

        loop {
            self.connection.wait_unblocked().await;

            if let Some(max) = options.max_attempts {
                if attempts >= max {
                    error!(topic = self.topic(), attempts, "giving up publishing message");
                    return Err(AmqpError::PublishAttemptsExceeded {
                        topic: self.topic().to_owned(),
                        attempts,
                    });
                }
            }
            attempts += 1;

            let channel = match self.connection.load_channel(PUBLISHER_CHANNEL).await {
                Ok(channel) => channel,
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => {
                    warn!(error = err.to_string(), attempts, "failure to load publisher channel");
                    time::sleep(retry_interval).await;
                    continue;
                }
            };

            let mut events = channel.subscribe();
            let properties = self.properties(message, options);

            match channel
                .publish(&exchange, self.topic(), &payload, &properties)
                .await
            {
                Ok(true) => {
                    debug!(topic = self.topic(), attempts, "message published");
                    return Ok(());
                }
                Ok(false) => {
                    match time::timeout(options.drain_timeout, wait_for_drain(&mut events)).await {
                        Ok(true) => debug!(topic = self.topic(), "channel drained, publishing again"),
                        Ok(false) => warn!(topic = self.topic(), "channel closed while waiting for drain"),
                        Err(_) => error!(topic = self.topic(), "drain timeout, waiting"),
                    }
                }
                Err(err) => {
                    warn!(error = err.to_string(), topic = self.topic(), attempts, "error publishing message");
                    time::sleep(retry_interval).await;
                }
            }
        }
    }

    fn properties(&self, message: &Message, options: &PublisherOptions) -> PublishProperties {
        let mut headers = BTreeMap::new();
        otel::inject_context(&Context::current(), &mut headers);

        PublishProperties {
            persistent: options.persistent,
            priority: message.priority,
            expiration: message.expiration,
            headers: FieldTable::from(headers),
        }
    }
}

#[async_trait]
impl ReplayTarget for Publisher {
    async fn deliver(&self, message: &Message) -> Result<(), AmqpError> {
        let options = self.options();
        self.deliver_with(message, &options).await
    }
}

/// Resolves to `true` on drain and `false` when the channel went away.
async fn wait_for_drain(events: &mut broadcast::Receiver<ChannelEvent>) -> bool {
    loop {
        match events.recv().await {
            Ok(ChannelEvent::Drain) => return true,
            Ok(ChannelEvent::Closed) | Ok(ChannelEvent::Error(_)) | Err(RecvError::Closed) => {
                return false
            }
            Err(RecvError::Lagged(_)) => continue,
        }
    }
}
