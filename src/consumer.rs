// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumer
//!
//! A [`QueueConsumer`] declares a queue with its retry/DLQ companions, consumes
//! it and hands every decoded message to a [`ConsumerHandler`].
//!
//! Failed messages are rejected without requeue. With retry enabled the broker
//! dead-letters them into the nack queue, holds them for the retry timeout and
//! routes them back. The `x-death` count the broker keeps on the message tells
//! how many times this already happened; once it reaches the configured
//! threshold the message is copied to the DLQ and acknowledged.
//!
//! The consumer re-registers itself on a fresh channel after every reconnection
//! or channel loss. Ephemeral queues get a new name each time.

use crate::{
    connection::{Connection, ConnectionState},
    errors::AmqpError,
    otel,
    queue::{QueueDefinition, QueueNames},
    topology::TopologyPlan,
    transport::{BrokerChannel, Delivery, DeliveryStream, PublishProperties},
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::types::FieldTable;
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use serde::de::DeserializeOwned;
use std::{
    borrow::Cow, future::Future, marker::PhantomData, panic::AssertUnwindSafe, sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A decoded message together with its broker metadata.
#[derive(Debug, Clone)]
pub struct ConsumerMessage<T> {
    pub payload: T,
    pub delivery: Delivery,
}

/// Processes consumed messages.
///
/// `Ok(true)` acknowledges the message. `Ok(false)`, an error or a panic send
/// it through the retry/DLQ pipeline.
#[async_trait]
pub trait ConsumerHandler<T>: Send + Sync {
    async fn exec(&self, ctx: &Context, message: ConsumerMessage<T>) -> Result<bool, HandlerError>;
}

#[async_trait]
impl<T, F, Fut> ConsumerHandler<T> for F
where
    T: Send + 'static,
    F: Fn(ConsumerMessage<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, message: ConsumerMessage<T>) -> Result<bool, HandlerError> {
        (self)(message).await
    }
}

/// What happened to a message the handler did not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Rejected without requeue; the broker dead-letters it if configured.
    Nacked,
    /// Copied to the DLQ and acknowledged.
    DeadLettered,
}

/// Number of times the broker dead-lettered this message, if it ever did.
pub fn death_count(headers: &FieldTable) -> Option<i64> {
    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|deaths| deaths.as_slice().first())
        .and_then(|death| death.as_field_table())
        .and_then(|death| death.inner().get(AMQP_HEADERS_COUNT))
        .and_then(|count| count.as_long_long_int())
}

/// Routes a failed delivery: nack below the threshold, DLQ at or above it.
pub(crate) async fn handle_failed_message(
    channel: &dyn BrokerChannel,
    dlq: &str,
    dead_letter_after: Option<u32>,
    delivery: &Delivery,
) -> Result<FailureDecision, AmqpError> {
    let count = death_count(&delivery.headers);

    match (count, dead_letter_after) {
        (Some(count), Some(threshold)) if count >= i64::from(threshold) => {
            error!(count, dlq, "too many attempts, sending to dlq");

            let properties = PublishProperties {
                persistent: true,
                priority: delivery.priority,
                expiration: None,
                headers: delivery.headers.clone(),
            };

            channel
                .send_to_queue(dlq, &delivery.data, &properties)
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error whiling sending to dlq");
                    AmqpError::PublishingToDQLError
                })?;

            channel.ack(delivery.delivery_tag).await.map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg to default queue");
                AmqpError::AckMessageError
            })?;

            Ok(FailureDecision::DeadLettered)
        }
        _ => {
            warn!(count = count.unwrap_or_default(), "error whiling handling msg, rejecting");

            channel.nack(delivery.delivery_tag, false).await.map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })?;

            Ok(FailureDecision::Nacked)
        }
    }
}

/// Consumer of one queue definition. Obtained from [`Connection::queue`].
pub struct QueueConsumer {
    connection: Connection,
    def: QueueDefinition,
}

impl QueueConsumer {
    pub fn new(connection: &Connection, def: QueueDefinition) -> QueueConsumer {
        QueueConsumer {
            connection: connection.clone(),
            def,
        }
    }

    /// Declares the queue set and starts consuming with `handler`.
    ///
    /// The definition is validated before anything is declared. Dropping the
    /// returned listener leaves the consumer running; call
    /// [`QueueListener::close`] to stop it.
    pub async fn listen<T, H>(self, handler: H) -> Result<QueueListener, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: ConsumerHandler<T> + 'static,
    {
        self.def.validate()?;

        let worker = Arc::new(Worker {
            channel_name: format!("consumer:{}:{}", self.def.prefetch, self.def.name),
            connection: self.connection,
            def: self.def,
            handler,
            _payload: PhantomData,
        });

        let link = worker.connection.subscribe_link();
        let generation = worker.connection.generation();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();

        let channel = worker.connection.load_channel(&worker.channel_name).await?;
        let active = worker.clone().configure(channel, ended_tx.clone(), 0).await?;
        info!(queue = active.names.queue.as_str(), "consumer registered");

        let (stop, stop_rx) = watch::channel(false);
        let queue = worker.def.name.clone();
        let task = tokio::spawn(worker.supervise(Supervision {
            active,
            generation,
            link,
            ended_tx,
            ended_rx,
            stop: stop_rx,
        }));

        Ok(QueueListener { queue, stop, task })
    }
}

/// Handle of a running consumer.
pub struct QueueListener {
    queue: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl QueueListener {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops consuming, waits for in-flight messages and closes the channel.
    pub async fn close(self) {
        self.stop.send_replace(true);
        if let Err(err) = self.task.await {
            error!(error = err.to_string(), queue = self.queue.as_str(), "consumer task failed");
        }
    }
}

struct Worker<T, H> {
    connection: Connection,
    def: QueueDefinition,
    handler: H,
    channel_name: String,
    _payload: PhantomData<fn() -> T>,
}

/// One registration of the consumer on one channel.
struct ActiveConsumer {
    epoch: u64,
    channel: Arc<dyn BrokerChannel>,
    names: QueueNames,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ActiveConsumer {
    /// Stops the delivery loop, lets in-flight messages settle and closes the channel.
    async fn retire(self, close_channel: bool) {
        self.stop.send_replace(true);
        let _ = self.task.await;

        if close_channel {
            if let Err(err) = self.channel.close().await {
                debug!(error = err.to_string(), queue = self.names.queue.as_str(), "failure to close consumer channel");
            }
        }
    }
}

struct Supervision {
    active: ActiveConsumer,
    generation: u64,
    link: watch::Receiver<crate::connection::Link>,
    ended_tx: mpsc::UnboundedSender<u64>,
    ended_rx: mpsc::UnboundedReceiver<u64>,
    stop: watch::Receiver<bool>,
}

impl<T, H> Worker<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: ConsumerHandler<T> + 'static,
{
    async fn configure(
        self: Arc<Self>,
        channel: Arc<dyn BrokerChannel>,
        ended: mpsc::UnboundedSender<u64>,
        epoch: u64,
    ) -> Result<ActiveConsumer, AmqpError> {
        let names = self.def.resolve_names();

        TopologyPlan::for_consumer(self.connection.exchange_name(), &self.def, &names)
            .install(channel.as_ref())
            .await?;
        channel.prefetch(self.def.prefetch).await?;

        let consumer_tag = format!("{}-{}", names.queue, Uuid::new_v4().simple());
        let deliveries = channel.consume(&names.queue, &consumer_tag).await?;
        debug!(queue = names.queue.as_str(), epoch, "listening to queue");

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.deliveries(
            channel.clone(),
            Arc::new(names.clone()),
            deliveries,
            stop_rx,
            ended,
            epoch,
        ));

        Ok(ActiveConsumer {
            epoch,
            channel,
            names,
            stop,
            task,
        })
    }

    async fn deliveries(
        self: Arc<Self>,
        channel: Arc<dyn BrokerChannel>,
        names: Arc<QueueNames>,
        deliveries: DeliveryStream,
        mut stop: watch::Receiver<bool>,
        ended: mpsc::UnboundedSender<u64>,
        epoch: u64,
    ) {
        let stopped = async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        };

        deliveries
            .take_until(stopped)
            .for_each_concurrent(usize::from(self.def.prefetch), |result| {
                let worker = self.clone();
                let channel = channel.clone();
                let names = names.clone();

                async move {
                    match result {
                        Ok(delivery) => worker.process(channel.as_ref(), &names, delivery).await,
                        Err(err) => error!(error = err.to_string(), "errors consume msg"),
                    }
                }
            })
            .await;

        let _ = ended.send(epoch);
    }

    async fn process(&self, channel: &dyn BrokerChannel, names: &QueueNames, delivery: Delivery) {
        let tracer = global::tracer("amqp consumer");
        let (ctx, mut span) = otel::new_span(&delivery.headers, &tracer, &names.queue);

        debug!(
            queue = names.queue.as_str(),
            routing_key = delivery.routing_key.as_str(),
            redelivered = delivery.redelivered,
            "received"
        );

        let accepted = match serde_json::from_slice::<T>(&delivery.data) {
            Err(err) => {
                warn!(error = err.to_string(), queue = names.queue.as_str(), "failure to parse payload");
                span.record_error(&AmqpError::ParsePayloadError);
                false
            }
            Ok(payload) => {
                let message = ConsumerMessage {
                    payload,
                    delivery: delivery.clone(),
                };

                match AssertUnwindSafe(self.handler.exec(&ctx, message))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(accepted)) => accepted,
                    Ok(Err(err)) => {
                        warn!(error = err.to_string(), queue = names.queue.as_str(), "handler failed");
                        span.record_error(err.as_ref());
                        false
                    }
                    Err(_) => {
                        error!(queue = names.queue.as_str(), "handler panicked");
                        false
                    }
                }
            }
        };

        if accepted {
            debug!("message successfully processed");
            match channel.ack(delivery.delivery_tag).await {
                Ok(()) => span.set_status(Status::Ok),
                Err(err) => {
                    error!(error = err.to_string(), "error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                }
            }
            span.end();
            return;
        }

        match handle_failed_message(channel, &names.dlq, self.def.dead_letter_after, &delivery).await {
            Ok(FailureDecision::Nacked) => span.set_status(Status::Error {
                description: Cow::from("msg was rejected"),
            }),
            Ok(FailureDecision::DeadLettered) => span.set_status(Status::Error {
                description: Cow::from("msg was sent to dlq"),
            }),
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
        span.end();
    }

    async fn supervise(self: Arc<Self>, mut s: Supervision) {
        let retry_interval = self.connection.config().reconnect_interval;

        loop {
            tokio::select! {
                _ = stop_requested(&mut s.stop) => break,
                changed = s.link.changed() => {
                    if changed.is_err() {
                        break;
                    }

                    let (state, generation) = {
                        let link = s.link.borrow_and_update();
                        (link.state, link.generation)
                    };

                    if state.is_terminal() {
                        break;
                    }

                    if state != ConnectionState::Connected || generation == s.generation {
                        continue;
                    }

                    s.generation = generation;
                    info!(queue = self.def.name.as_str(), generation, "connection recovered, re-registering consumer");
                    if !self.clone().rebind(&mut s).await {
                        break;
                    }
                }
                Some(epoch) = s.ended_rx.recv() => {
                    if epoch != s.active.epoch {
                        continue;
                    }

                    warn!(queue = s.active.names.queue.as_str(), "consumer stream ended, re-registering");
                    if !pause(&mut s.stop, retry_interval).await || !self.clone().rebind(&mut s).await {
                        break;
                    }
                }
            }
        }

        info!(queue = self.def.name.as_str(), "consumer stopped");
        let Supervision { active, .. } = s;
        active.retire(true).await;
    }

    /// Registers the consumer on the current channel and retires the previous
    /// registration. Returns `false` once the connection is gone for good or
    /// the listener asked to stop.
    async fn rebind(self: Arc<Self>, s: &mut Supervision) -> bool {
        let retry_interval = self.connection.config().reconnect_interval;

        loop {
            let loaded = tokio::select! {
                _ = stop_requested(&mut s.stop) => return false,
                loaded = self.connection.load_channel(&self.channel_name) => loaded,
            };

            let channel = match loaded {
                Ok(channel) => channel,
                Err(err) if err.is_terminal() => {
                    error!(error = err.to_string(), queue = self.def.name.as_str(), "cannot re-register consumer");
                    return false;
                }
                Err(err) => {
                    warn!(error = err.to_string(), queue = self.def.name.as_str(), "failure to load consumer channel");
                    if !pause(&mut s.stop, retry_interval).await {
                        return false;
                    }
                    continue;
                }
            };

            let same_channel = Arc::ptr_eq(&channel, &s.active.channel);
            if same_channel && !s.active.task.is_finished() {
                return true;
            }

            let epoch = s.active.epoch + 1;
            let configured = tokio::select! {
                _ = stop_requested(&mut s.stop) => return false,
                configured = self.clone().configure(channel, s.ended_tx.clone(), epoch) => configured,
            };

            match configured {
                Ok(next) => {
                    debug!(queue = next.names.queue.as_str(), epoch, "consumer re-registered");
                    let previous = std::mem::replace(&mut s.active, next);
                    previous.retire(!same_channel).await;
                    return true;
                }
                Err(err) if err.is_terminal() => {
                    error!(error = err.to_string(), queue = self.def.name.as_str(), "cannot re-register consumer");
                    return false;
                }
                Err(err) => {
                    error!(error = err.to_string(), queue = self.def.name.as_str(), "failure to re-register consumer");
                    if !pause(&mut s.stop, retry_interval).await {
                        return false;
                    }
                }
            }
        }
    }
}

/// Resolves once the listener asks to stop. A dropped listener detaches the
/// consumer instead, so this never resolves afterwards.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Sleeps for `period`. Returns `false` when a stop was requested meanwhile.
async fn pause(stop: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = stop_requested(stop) => false,
        _ = time::sleep(period) => true,
    }
}
