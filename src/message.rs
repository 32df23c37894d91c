// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// An outgoing message: a JSON payload plus optional priority and expiration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub payload: Value,
    pub priority: Option<u8>,
    pub expiration: Option<Duration>,
}

impl Message {
    pub fn new<T: Serialize>(payload: &T) -> Result<Message, AmqpError> {
        let payload = serde_json::to_value(payload)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?;

        Ok(Message::from_value(payload))
    }

    pub fn from_value(payload: Value) -> Message {
        Message {
            payload,
            priority: None,
            expiration: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Per-message time to live. Used by delay queues declared with
    /// `use_message_timeout`.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(&self.payload).map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
    }
}

/// What happened to a message handed to [`Publisher::send`](crate::publisher::Publisher::send).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    /// The broker accepted the message.
    Delivered,
    /// The message was kept locally by a fallback adapter for later replay.
    Buffered { adapter: String },
}

impl PublishResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishResult::Delivered)
    }

    pub fn is_buffered(&self) -> bool {
        matches!(self, PublishResult::Buffered { .. })
    }
}
