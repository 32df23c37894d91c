// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module turns queue and delay-queue definitions into an ordered list of
//! broker declarations and installs them on a channel.
//!
//! Building a [`TopologyPlan`] is pure: it can be inspected without a broker.
//! Installing it replays the steps in order and stops at the first failure.

use crate::{
    delay_queue::DelayQueueDefinition,
    errors::AmqpError,
    queue::{QueueDefinition, QueueNames},
    transport::BrokerChannel,
};
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortShortUInt, ShortString};
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to enable message priorities
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";

/// Arguments and flags of one queue declaration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
}

impl QueueDeclaration {
    pub fn new(name: &str) -> QueueDeclaration {
        QueueDeclaration {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Routes expired and rejected messages to `routing_key` on `exchange`.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.arguments.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange)),
        );
        self.arguments.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(routing_key)),
        );
        self
    }

    pub fn message_ttl(mut self, ttl_ms: i32) -> Self {
        self.arguments.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl_ms)),
        );
        self
    }

    pub fn max_priority(mut self, max: u8) -> Self {
        self.arguments.insert(
            ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
            AMQPValue::ShortShortUInt(ShortShortUInt::from(max)),
        );
        self
    }

    pub fn argument(&self, key: &str) -> Option<&AMQPValue> {
        self.arguments.inner().get(key)
    }
}

/// Binding of a queue to a routing key on an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyStep {
    DeclareQueue(QueueDeclaration),
    Bind(QueueBinding),
}

/// Ordered declarations for one consumer or delay queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyPlan {
    pub(crate) steps: Vec<TopologyStep>,
}

impl TopologyPlan {
    pub fn steps(&self) -> &[TopologyStep] {
        &self.steps
    }

    pub fn declarations(&self) -> impl Iterator<Item = &QueueDeclaration> {
        self.steps.iter().filter_map(|step| match step {
            TopologyStep::DeclareQueue(decl) => Some(decl),
            _ => None,
        })
    }

    pub fn bindings(&self) -> impl Iterator<Item = &QueueBinding> {
        self.steps.iter().filter_map(|step| match step {
            TopologyStep::Bind(binding) => Some(binding),
            _ => None,
        })
    }

    fn declare(&mut self, decl: QueueDeclaration) {
        self.steps.push(TopologyStep::DeclareQueue(decl));
    }

    fn bind(&mut self, queue: &str, exchange: &str, routing_key: &str) {
        self.steps
            .push(TopologyStep::Bind(QueueBinding::new(queue, exchange, routing_key)));
    }

    /// Queue set of a consumer, in declaration order: nack queue, DLQ, main queue.
    ///
    /// The main queue dead-letters rejected messages into the nack queue. With a
    /// retry timeout the nack queue holds them for that long and dead-letters
    /// them back onto the main queue through the retry routing key.
    pub fn for_consumer(exchange: &str, def: &QueueDefinition, names: &QueueNames) -> TopologyPlan {
        let mut plan = TopologyPlan::default();

        if def.enable_nack {
            let mut nack = QueueDeclaration::new(&names.nack_queue)
                .durable(def.durable)
                .auto_delete(def.ephemeral);

            if let Some(timeout) = def.retry_timeout {
                nack = nack
                    .dead_letter(exchange, &names.retry_topic)
                    .message_ttl(ttl_millis(timeout.as_millis()));
            }

            plan.declare(nack);
            plan.bind(&names.nack_queue, exchange, &names.nack_topic);
        }

        if def.dead_letter_after.is_some() {
            plan.declare(QueueDeclaration::new(&names.dlq).durable(true));
        }

        let mut main = QueueDeclaration::new(&names.queue)
            .durable(def.durable)
            .auto_delete(def.ephemeral)
            .exclusive(def.exclusive);

        if def.enable_nack {
            main = main.dead_letter(exchange, &names.nack_topic);
        }

        if let Some(max) = def.max_priority {
            main = main.max_priority(max);
        }

        plan.declare(main);

        for topic in &def.topics {
            plan.bind(&names.queue, exchange, topic);
        }

        if def.retry_enabled() {
            plan.bind(&names.queue, exchange, &names.retry_topic);
        }

        plan
    }

    /// Single holding queue bound to the source topic that dead-letters onto
    /// the destination topic once its messages expire.
    pub fn for_delay_queue(exchange: &str, def: &DelayQueueDefinition) -> TopologyPlan {
        let mut plan = TopologyPlan::default();

        let mut queue = QueueDeclaration::new(&def.name)
            .durable(def.durable)
            .dead_letter(exchange, &def.to_topic);

        if let Some(timeout) = def.fixed_timeout() {
            queue = queue.message_ttl(ttl_millis(timeout.as_millis()));
        }

        plan.declare(queue);
        plan.bind(&def.name, exchange, &def.from_topic);

        plan
    }

    /// Declares every step on the channel, in order.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for step in &self.steps {
            match step {
                TopologyStep::DeclareQueue(decl) => {
                    debug!("creating queue: {}", decl.name);
                    channel.declare_queue(decl).await.inspect_err(|err| {
                        error!(error = err.to_string(), queue = decl.name.as_str(), "failure to declare queue");
                    })?;
                }
                TopologyStep::Bind(binding) => {
                    debug!(
                        "binding queue: {} to the exchange: {} with the key: {}",
                        binding.queue_name, binding.exchange_name, binding.routing_key
                    );
                    channel
                        .bind_queue(
                            &binding.queue_name,
                            &binding.exchange_name,
                            &binding.routing_key,
                        )
                        .await
                        .inspect_err(|err| {
                            error!(error = err.to_string(), "error to bind queue to exchange");
                        })?;
                }
            }
        }

        Ok(())
    }
}

/// Durations were validated to fit an `i32` of milliseconds.
fn ttl_millis(ms: u128) -> i32 {
    i32::try_from(ms).unwrap_or(i32::MAX)
}

/// Reads an integer queue argument regardless of its wire width.
pub fn argument_as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

/// Reads a string queue argument.
pub fn argument_as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}
