// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Transport
//!
//! Implementation of the transport contract on top of lapin.
//!
//! lapin reports connection and channel failures through callbacks; they are
//! forwarded to the broadcast event streams. Flow control is not reported as a
//! callback, so a small task polls the connection status for it.

use crate::{
    config::ClientProperties,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::JSON_CONTENT_TYPE,
    topology::QueueDeclaration,
    transport::{
        BrokerChannel, BrokerConnection, ChannelEvent, ConnectionEvent, Delivery, DeliveryStream,
        EventHub, PublishProperties, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, ConnectionProperties,
};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::broadcast, time};
use tracing::{debug, error};
use uuid::Uuid;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);
const PERSISTENT_DELIVERY_MODE: u8 = 2;

#[derive(Debug, Default, Clone, Copy)]
pub struct LapinTransport;

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        uri: &str,
        properties: &ClientProperties,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let mut options = ConnectionProperties::default()
            .with_connection_name(LongString::from(properties.connection_name.clone()));
        options.client_properties.insert(
            ShortString::from("product"),
            AMQPValue::LongString(LongString::from(properties.product.clone())),
        );

        let conn = lapin::Connection::connect(uri, options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                AmqpError::ConnectionError(err.to_string())
            })?;
        debug!("amqp connected");

        let events = EventHub::new();
        let on_error = events.sender();
        conn.on_error(move |err| {
            let _ = on_error.send(ConnectionEvent::Error(err.to_string()));
        });

        let conn = Arc::new(conn);
        tokio::spawn(watch_status(Arc::downgrade(&conn), events.sender()));

        Ok(Arc::new(LapinConnection { conn, events }))
    }
}

async fn watch_status(conn: Weak<lapin::Connection>, events: broadcast::Sender<ConnectionEvent>) {
    let mut ticker = time::interval(STATUS_POLL_INTERVAL);
    let mut blocked = false;

    loop {
        ticker.tick().await;

        let Some(conn) = conn.upgrade() else {
            break;
        };
        let status = conn.status();

        if !status.connected() {
            let _ = events.send(ConnectionEvent::Closed(None));
            break;
        }

        if status.blocked() != blocked {
            blocked = status.blocked();
            let event = if blocked {
                ConnectionEvent::Blocked("connection.blocked".to_owned())
            } else {
                ConnectionEvent::Unblocked
            };
            let _ = events.send(event);
        }
    }
}

struct LapinConnection {
    conn: Arc<lapin::Connection>,
    events: EventHub<ConnectionEvent>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = self.conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;
        debug!("channel created");

        let events = EventHub::new();
        let on_error = events.sender();
        channel.on_error(move |err| {
            let _ = on_error.send(ChannelEvent::Error(err.to_string()));
        });

        Ok(Arc::new(LapinChannel { channel, events }))
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn
            .close(200, "closing")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))?;
        self.events.send(ConnectionEvent::Closed(Some("closed by client".to_owned())));

        Ok(())
    }
}

struct LapinChannel {
    channel: Channel,
    events: EventHub<ChannelEvent>,
}

fn basic_properties(properties: &PublishProperties) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(properties.headers.clone());

    if properties.persistent {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    if let Some(priority) = properties.priority {
        props = props.with_priority(priority);
    }

    if let Some(expiration) = properties.expiration {
        props = props.with_expiration(ShortString::from(expiration.as_millis().to_string()));
    }

    props
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        headers: delivery.properties.headers().clone().unwrap_or_default(),
        priority: *delivery.properties.priority(),
        expiration: delivery.properties.expiration().as_ref().map(|e| e.to_string()),
        data: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        self.channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to declare the exchange");
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &declaration.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: declaration.durable,
                    exclusive: declaration.exclusive,
                    auto_delete: declaration.auto_delete,
                    nowait: false,
                },
                declaration.arguments.clone(),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error to declare the queue");
                AmqpError::DeclareQueueError(declaration.name.clone())
            })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    /// lapin buffers frames internally and never refuses a write, so this
    /// always reports `true` on success.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<bool, AmqpError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                basic_properties(properties),
            )
            .await
            .map(|_| true)
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError> {
        self.publish("", queue, payload, properties).await.map(|_| ())
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(into_delivery)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|_| AmqpError::AckMessageError)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|_| AmqpError::NackMessageError)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let closed = if self.channel.status().connected() {
            self.channel
                .close(200, "closing")
                .await
                .map_err(|err| AmqpError::ChannelError(err.to_string()))
        } else {
            Ok(())
        };

        self.events.send(ChannelEvent::Closed);
        closed
    }
}
