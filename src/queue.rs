// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! A [`QueueDefinition`] describes a consumption endpoint: the base queue, the
//! topics it is bound to and its retry/dead-letter policy. From the base name
//! it derives the companion queues used by the retry pipeline:
//!
//! - `<name>.nack`: timed holding area for failed messages
//! - `<name>.retry`: routing key used to bring expired messages back
//! - `<name>.dlq`: terminal storage once the retry budget is spent
//!
//! Setters only record values. [`QueueDefinition::validate`] runs once, right
//! before the topology is declared.

use crate::errors::AmqpError;
use std::time::Duration;
use uuid::Uuid;

pub const NACK_SUFFIX: &str = ".nack";
pub const RETRY_SUFFIX: &str = ".retry";
pub const DLQ_SUFFIX: &str = ".dlq";
pub const EPHEMERAL_INFIX: &str = ".ephemeral.";

/// Definition of a consumed queue and its retry/DLQ policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) topics: Vec<String>,
    pub(crate) durable: bool,
    pub(crate) prefetch: u16,
    pub(crate) retry_timeout: Option<Duration>,
    pub(crate) dead_letter_after: Option<u32>,
    pub(crate) enable_nack: bool,
    pub(crate) ephemeral: bool,
    pub(crate) exclusive: bool,
    pub(crate) max_priority: Option<u8>,
}

impl QueueDefinition {
    /// Creates a non-durable queue definition with a prefetch of one.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            topics: vec![],
            durable: false,
            prefetch: 1,
            retry_timeout: None,
            dead_letter_after: None,
            enable_nack: true,
            ephemeral: false,
            exclusive: false,
            max_priority: None,
        }
    }

    /// Binds the queue to a topic. Duplicates are ignored.
    pub fn topic(mut self, topic: &str) -> Self {
        if !self.topics.iter().any(|t| t == topic) {
            self.topics.push(topic.to_owned());
        }
        self
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Maximum number of unacknowledged messages held by the consumer.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = count;
        self
    }

    /// Delay before a failed message is delivered again.
    ///
    /// Requires [`dead_letter_after`](Self::dead_letter_after).
    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = Some(timeout);
        self
    }

    /// Number of failures after which a message is moved to the DLQ.
    pub fn dead_letter_after(mut self, failures: u32) -> Self {
        self.dead_letter_after = Some(failures);
        self
    }

    /// Skips the nack queue. Failed messages are dropped by the broker.
    pub fn disable_nack(mut self) -> Self {
        self.enable_nack = false;
        self
    }

    /// Uses a uniquely named, auto-deleted queue.
    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Enables message priorities up to `max`.
    pub fn priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch
    }

    pub fn retry_enabled(&self) -> bool {
        self.enable_nack && self.retry_timeout.is_some()
    }

    /// Checks the definition before any broker declaration happens.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.name.trim().is_empty() {
            return Err(AmqpError::invalid("queue name must not be empty"));
        }

        if self.topics.is_empty() {
            return Err(AmqpError::invalid(format!(
                "queue `{}`: you must specify at least one topic",
                self.name
            )));
        }

        if self.topics.iter().any(|t| t.is_empty()) {
            return Err(AmqpError::invalid(format!(
                "queue `{}`: topics must not be empty",
                self.name
            )));
        }

        if self.retry_timeout.is_some() && self.dead_letter_after.is_none() {
            return Err(AmqpError::invalid(format!(
                "queue `{}`: if you use retry timeout, you need to specify dead letter after",
                self.name
            )));
        }

        if let Some(timeout) = self.retry_timeout {
            let ms = timeout.as_millis();
            if ms == 0 || ms > i32::MAX as u128 {
                return Err(AmqpError::invalid(format!(
                    "queue `{}`: invalid retry timeout {timeout:?}",
                    self.name
                )));
            }
        }

        if self.dead_letter_after == Some(0) {
            return Err(AmqpError::invalid(format!(
                "queue `{}`: dead letter after must be greater than zero",
                self.name
            )));
        }

        if self.ephemeral && self.dead_letter_after.is_some() {
            return Err(AmqpError::invalid(format!(
                "queue `{}`: you cannot use a dlq with ephemeral queues",
                self.name
            )));
        }

        if self.prefetch == 0 {
            return Err(AmqpError::invalid(format!(
                "queue `{}`: prefetch must be greater than zero",
                self.name
            )));
        }

        if let Some(max) = self.max_priority {
            if max <= 1 {
                return Err(AmqpError::invalid(format!(
                    "queue `{}`: invalid priority {max} (must be between 2 and 255)",
                    self.name
                )));
            }
        }

        Ok(())
    }

    /// Resolves the concrete queue names. Ephemeral definitions get a fresh
    /// random suffix on every call.
    pub fn resolve_names(&self) -> QueueNames {
        let name = if self.ephemeral {
            format!("{}{}{}", self.name, EPHEMERAL_INFIX, Uuid::new_v4().simple())
        } else {
            self.name.clone()
        };

        QueueNames::new(&name)
    }
}

/// Concrete names of a consumer's queue set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub queue: String,
    pub nack_queue: String,
    pub nack_topic: String,
    pub retry_topic: String,
    pub dlq: String,
}

impl QueueNames {
    pub fn new(queue: &str) -> QueueNames {
        QueueNames {
            queue: queue.to_owned(),
            nack_queue: format!("{queue}{NACK_SUFFIX}"),
            nack_topic: format!("{queue}{NACK_SUFFIX}"),
            retry_topic: format!("{queue}{RETRY_SUFFIX}"),
            dlq: format!("{queue}{DLQ_SUFFIX}"),
        }
    }
}
