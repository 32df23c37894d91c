// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delay Queues
//!
//! A delay queue holds messages published to a source topic for a while and
//! then dead-letters them onto a destination topic. It gives delayed delivery
//! without broker-side scheduling support.
//!
//! The delay is either fixed (a queue TTL) or taken from each message's
//! expiration, in which case the publisher sets it per message.

use crate::{connection::Connection, errors::AmqpError, topology::TopologyPlan};
use std::time::Duration;
use tracing::{debug, warn};

/// Definition of a delay queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayQueueDefinition {
    pub(crate) name: String,
    pub(crate) from_topic: String,
    pub(crate) to_topic: String,
    pub(crate) durable: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) use_message_timeout: bool,
}

impl DelayQueueDefinition {
    /// Creates a durable delay queue definition.
    pub fn new(name: &str) -> DelayQueueDefinition {
        DelayQueueDefinition {
            name: name.to_owned(),
            from_topic: String::new(),
            to_topic: String::new(),
            durable: true,
            timeout: None,
            use_message_timeout: false,
        }
    }

    /// Topic whose messages enter the delay queue.
    pub fn from(mut self, topic: &str) -> Self {
        self.from_topic = topic.to_owned();
        self
    }

    /// Topic the messages are routed to once the delay elapsed.
    pub fn to(mut self, topic: &str) -> Self {
        self.to_topic = topic.to_owned();
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Holds every message for `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self.use_message_timeout = false;
        self
    }

    /// Leaves the queue without TTL; each message carries its own expiration.
    pub fn use_message_timeout(mut self) -> Self {
        self.timeout = None;
        self.use_message_timeout = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn fixed_timeout(&self) -> Option<Duration> {
        if self.use_message_timeout {
            return None;
        }
        self.timeout
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.name.trim().is_empty() {
            return Err(AmqpError::invalid("delay queue name must not be empty"));
        }

        if self.from_topic.is_empty() {
            return Err(AmqpError::invalid(format!(
                "delay queue `{}`: you must specify a source topic",
                self.name
            )));
        }

        if self.to_topic.is_empty() {
            return Err(AmqpError::invalid(format!(
                "delay queue `{}`: you must specify a destination topic",
                self.name
            )));
        }

        if self.use_message_timeout {
            return Ok(());
        }

        match self.timeout {
            Some(timeout) if !timeout.is_zero() && timeout.as_millis() <= i32::MAX as u128 => {
                Ok(())
            }
            _ => Err(AmqpError::invalid(format!(
                "delay queue `{}`: you must specify a positive timeout or use the message timeout",
                self.name
            ))),
        }
    }
}

/// One-shot declaration of a delay queue.
pub struct DelayQueue {
    connection: Connection,
    def: DelayQueueDefinition,
}

impl DelayQueue {
    pub fn new(connection: &Connection, def: DelayQueueDefinition) -> DelayQueue {
        DelayQueue {
            connection: connection.clone(),
            def,
        }
    }

    /// Declares the queue on a dedicated channel and closes the channel.
    pub async fn create(&self) -> Result<(), AmqpError> {
        self.def.validate()?;

        let plan = TopologyPlan::for_delay_queue(self.connection.exchange_name(), &self.def);
        let channel = self.connection.open_channel().await?;

        let installed = plan.install(channel.as_ref()).await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), queue = self.def.name.as_str(), "failure to close delay queue channel");
        }

        installed?;
        debug!(
            queue = self.def.name.as_str(),
            from = self.def.from_topic.as_str(),
            to = self.def.to_topic.as_str(),
            "delay queue created"
        );

        Ok(())
    }
}
