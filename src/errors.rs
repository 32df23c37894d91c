// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilience Layer
//!
//! This module provides the error taxonomy shared by the connection supervisor,
//! the channel registry, consumers, publishers and the fallback store.
//!
//! Errors fall into a few families:
//! - configuration errors, rejected before anything reaches the broker and never retried
//! - transient connectivity errors, retried by the supervisor and the publisher
//! - message-processing errors, routed through the retry/DLQ pipeline
//! - terminal errors (attempt caps exhausted, explicit shutdown), surfaced to the caller

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The broker address could not be parsed or uses an unsupported scheme
    #[error("invalid dsn `{0}`")]
    InvalidDsn(String),

    /// A connection, queue or delay queue definition was rejected
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// A connection attempt did not complete within the configured timeout
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The supervisor gave up after the configured number of attempts
    #[error("number of connection attempts exceeded: {0}")]
    ConnectionAttemptsExceeded(u32),

    /// The connection was shut down explicitly
    #[error("connection closed")]
    ConnectionClosed,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The channel was closed by the broker or locally
    #[error("channel closed")]
    ChannelClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// A publish was attempted more times than the publisher allows
    #[error("failure to publish to `{topic}` after {attempts} attempts")]
    PublishAttemptsExceeded { topic: String, attempts: u32 },

    /// Error serializing a message payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq")]
    PublishingToDQLError,
}

impl AmqpError {
    /// Errors caused by a bad definition. Waiting never fixes them.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AmqpError::InvalidDsn(_) | AmqpError::InvalidConfiguration(_)
        )
    }

    /// Errors after which retry loops must stop and report to the caller.
    pub fn is_terminal(&self) -> bool {
        self.is_configuration()
            || matches!(
                self,
                AmqpError::ConnectionAttemptsExceeded(_)
                    | AmqpError::ConnectionClosed
                    | AmqpError::PublishAttemptsExceeded { .. }
                    | AmqpError::SerializePayloadError(_)
            )
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        AmqpError::InvalidConfiguration(reason.into())
    }
}
