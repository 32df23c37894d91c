// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervision
//!
//! A [`Connection`] owns one logical broker connection for its whole lifetime.
//! A background supervisor task connects, watches the connection for
//! flow-control and closure events, and reconnects with a constant backoff.
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Blocked
//!                     ^             |
//!                     +-------------+ (closed by broker or network)
//!
//! any state -> Failed (attempt cap exhausted)   any state -> Closed (close())
//! ```
//!
//! Every successful connection bumps a generation counter. The channel registry
//! and the consumers compare generations to notice that their channels belong
//! to a connection that no longer exists.

use crate::{
    amqp::LapinTransport,
    config::ConnectionConfig,
    delay_queue::{DelayQueue, DelayQueueDefinition},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    fallback::{self, FallbackAdapter, FallbackEntry, MemoryFallback, ReplayTarget},
    logging,
    message::{Message, PublishResult},
    publisher::{Publisher, PublisherShared},
    queue::QueueDefinition,
    consumer::QueueConsumer,
    registry::{self, ChannelRegistry},
    transport::{BrokerChannel, BrokerConnection, ConnectionEvent, Transport},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Lifecycle state of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but the broker asked publishers to pause.
    Blocked,
    /// The supervisor gave up. See [`Connection::connect`] for the error.
    Failed,
    /// Shut down through [`Connection::close`].
    Closed,
}

impl ConnectionState {
    pub fn is_up(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Blocked)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

/// Retry counters of the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Consecutive failed attempts since the last successful connection.
    pub failed_attempts: u32,
    /// Connections established so far.
    pub connections: u64,
}

/// Snapshot shared by the supervisor with everyone watching the connection.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) state: ConnectionState,
    pub(crate) handle: Option<Arc<dyn BrokerConnection>>,
    pub(crate) generation: u64,
    pub(crate) failure: Option<AmqpError>,
    pub(crate) last_error: Option<AmqpError>,
    pub(crate) stats: ConnectionStats,
}

impl Default for Link {
    fn default() -> Self {
        Link {
            state: ConnectionState::Disconnected,
            handle: None,
            generation: 0,
            failure: None,
            last_error: None,
            stats: ConnectionStats::default(),
        }
    }
}

pub(crate) struct Supervisor {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    link: watch::Sender<Link>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl Supervisor {
    fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Supervisor {
        Supervisor {
            config,
            transport,
            link: watch::Sender::new(Link::default()),
            shutdown: watch::Sender::new(false),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Link> {
        self.link.subscribe()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.link.borrow().state
    }

    pub(crate) fn generation(&self) -> u64 {
        self.link.borrow().generation
    }

    /// Spawns the supervisor loop once.
    pub(crate) fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        tokio::spawn(self.clone().run());
    }

    /// Waits for an established connection and returns it with its generation.
    pub(crate) async fn connected(
        self: &Arc<Self>,
    ) -> Result<(Arc<dyn BrokerConnection>, u64), AmqpError> {
        self.start();

        let mut link = self.link.subscribe();
        let current = link
            .wait_for(|l| l.handle.is_some() || l.state.is_terminal())
            .await
            .map_err(|_| AmqpError::ConnectionClosed)?;

        match (&current.handle, &current.failure) {
            (Some(handle), _) => Ok((handle.clone(), current.generation)),
            (None, Some(failure)) => Err(failure.clone()),
            (None, None) => Err(AmqpError::ConnectionClosed),
        }
    }

    pub(crate) async fn wait_unblocked(&self) {
        let mut link = self.link.subscribe();
        let _ = link
            .wait_for(|l| l.state != ConnectionState::Blocked)
            .await;
    }

    fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn shutdown(&self) {
        self.request_shutdown();

        if !self.started.swap(true, Ordering::SeqCst) {
            self.mark_closed();
            return;
        }

        let mut link = self.link.subscribe();
        let _ = link.wait_for(|l| l.state.is_terminal()).await;
    }

    fn set_state(&self, state: ConnectionState) {
        self.link.send_if_modified(|l| {
            if l.state == state {
                return false;
            }
            l.state = state;
            true
        });
    }

    fn record_failed_attempt(&self, attempts: u32, err: &AmqpError) {
        self.link.send_modify(|l| {
            l.state = ConnectionState::Disconnected;
            l.stats.failed_attempts = attempts;
            l.last_error = Some(err.clone());
        });
    }

    fn mark_closed(&self) {
        self.link.send_modify(|l| {
            l.state = ConnectionState::Closed;
            l.handle = None;
        });
    }

    fn fail(&self, err: AmqpError) {
        error!(error = err.to_string(), "giving up on the broker connection");

        self.link.send_modify(|l| {
            l.state = ConnectionState::Failed;
            l.handle = None;
            l.failure = Some(err);
        });

        if self.config.exit_process_on_failure {
            error!("finishing the process");
            std::process::exit(1);
        }
    }

    async fn run(self: Arc<Self>) {
        let uri = match self.config.connection_uri() {
            Ok(uri) => uri,
            Err(err) => return self.fail(err),
        };
        let properties = self.config.client_properties();
        let mut shutdown = self.shutdown.subscribe();
        let mut failed_attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            debug!(failed_attempts, "connecting to broker");

            let attempt = tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => break,
                attempt = time::timeout(
                    self.config.connect_timeout,
                    self.transport.connect(&uri, &properties),
                ) => attempt,
            };

            match attempt {
                Ok(Ok(connection)) => {
                    failed_attempts = 0;
                    if self.supervise(connection, &mut shutdown).await {
                        return;
                    }
                }
                Ok(Err(err)) => {
                    failed_attempts += 1;
                    self.record_failed_attempt(failed_attempts, &err);
                    warn!(error = err.to_string(), failed_attempts, "failure to connect");

                    let never_connected = self.link.borrow().stats.connections == 0;
                    if self.config.fail_on_first_connect_error && never_connected {
                        return self.fail(err);
                    }
                }
                Err(_) => {
                    let err = AmqpError::ConnectTimeout(self.config.connect_timeout);
                    failed_attempts += 1;
                    self.record_failed_attempt(failed_attempts, &err);
                    warn!(error = err.to_string(), failed_attempts, "connection attempt timed out");
                }
            }

            if let Some(max) = self.config.max_connection_attempts {
                if failed_attempts >= max {
                    return self.fail(AmqpError::ConnectionAttemptsExceeded(failed_attempts));
                }
            }

            tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => break,
                _ = time::sleep(self.config.reconnect_interval) => {}
            }
        }

        self.mark_closed();
        info!("connection supervisor stopped");
    }

    /// Publishes the new connection and follows its events until it goes away.
    /// Returns `true` when the supervisor was asked to shut down.
    async fn supervise(
        &self,
        connection: Arc<dyn BrokerConnection>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut events = connection.subscribe();

        self.link.send_modify(|l| {
            l.state = ConnectionState::Connected;
            l.handle = Some(connection.clone());
            l.generation += 1;
            l.failure = None;
            l.last_error = None;
            l.stats.connections += 1;
            l.stats.failed_attempts = 0;
        });

        let stats = self.link.borrow().stats;
        info!(
            connections = stats.connections,
            generation = self.generation(),
            "connected to broker"
        );

        let stopped = loop {
            tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => break true,
                event = events.recv() => match event {
                    Ok(ConnectionEvent::Blocked(reason)) => {
                        warn!(reason = reason.as_str(), "connection blocked by broker");
                        self.set_state(ConnectionState::Blocked);
                    }
                    Ok(ConnectionEvent::Unblocked) => {
                        info!("connection unblocked");
                        self.set_state(ConnectionState::Connected);
                    }
                    Ok(ConnectionEvent::Closed(reason)) => {
                        warn!(reason = ?reason, "connection closed");
                        break false;
                    }
                    Ok(ConnectionEvent::Error(err)) => {
                        error!(error = err.as_str(), "connection error");
                        break false;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection events lagged");
                    }
                    Err(RecvError::Closed) => break false,
                },
            }
        };

        self.link.send_modify(|l| {
            l.handle = None;
            l.state = if stopped {
                ConnectionState::Closed
            } else {
                ConnectionState::Disconnected
            };
        });

        if let Err(err) = connection.close().await {
            debug!(error = err.to_string(), "failure to close the connection");
        }

        stopped
    }
}

struct Inner {
    config: ConnectionConfig,
    exchange: ExchangeDefinition,
    supervisor: Arc<Supervisor>,
    registry: ChannelRegistry,
    publishers: RwLock<HashMap<String, Arc<PublisherShared>>>,
    fallback: RwLock<Arc<dyn FallbackAdapter>>,
    replaying: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.supervisor.request_shutdown();
    }
}

/// Application-facing handle of one supervised broker connection.
///
/// Cloning is cheap; all clones share the same supervisor, channel registry,
/// publishers and fallback store.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Creates a connection backed by lapin and installs the default log output.
    ///
    /// Nothing is opened until the first channel is requested or
    /// [`connect`](Self::connect) is called.
    pub fn new(config: ConnectionConfig) -> Result<Connection, AmqpError> {
        Connection::with_transport(config, Arc::new(LapinTransport::default()))
    }

    pub fn with_transport(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Connection, AmqpError> {
        config.validate()?;
        logging::install(config.log_level);

        let exchange =
            ExchangeDefinition::new(&config.exchange_name).kind(config.exchange_kind.clone());
        let supervisor = Arc::new(Supervisor::new(config.clone(), transport));
        let registry = ChannelRegistry::new(supervisor.clone(), exchange.clone());

        Ok(Connection {
            inner: Arc::new(Inner {
                config,
                exchange,
                supervisor,
                registry,
                publishers: RwLock::new(HashMap::new()),
                fallback: RwLock::new(Arc::new(MemoryFallback::default())),
                replaying: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn exchange_name(&self) -> &str {
        self.inner.exchange.name()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_up()
    }

    pub fn is_blocked(&self) -> bool {
        self.state() == ConnectionState::Blocked
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.supervisor.link.borrow().stats
    }

    /// Error of the most recent failed attempt, cleared once connected.
    pub fn last_error(&self) -> Option<AmqpError> {
        self.inner.supervisor.link.borrow().last_error.clone()
    }

    /// Number of connections established so far; changes on every reconnection.
    pub fn generation(&self) -> u64 {
        self.inner.supervisor.generation()
    }

    pub(crate) fn subscribe_link(&self) -> watch::Receiver<Link> {
        self.inner.supervisor.subscribe()
    }

    /// Waits until the connection state satisfies `predicate`.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> ConnectionState
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut link = self.subscribe_link();
        let state = match link.wait_for(|l| predicate(&l.state)).await {
            Ok(current) => current.state,
            Err(_) => self.state(),
        };
        state
    }

    /// Starts the supervisor if needed and waits for the broker connection.
    ///
    /// Concurrent callers share the same attempt. Errors are returned only once
    /// the supervisor reached a terminal state.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.start();
        self.inner
            .supervisor
            .connected()
            .await
            .map(|(connection, _)| connection)
    }

    /// Returns the cached channel registered under `name`, creating it on demand.
    pub async fn load_channel(&self, name: &str) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.start();
        self.inner.registry.load(name).await
    }

    /// Opens a channel outside of the registry. The caller owns and closes it.
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.start();
        registry::open_channel(&self.inner.supervisor, &self.inner.exchange)
            .await
            .map(|opened| opened.channel)
    }

    pub(crate) async fn wait_unblocked(&self) {
        self.inner.supervisor.wait_unblocked().await
    }

    /// Returns the publisher registered for `topic`, registering one if needed.
    pub fn topic(&self, topic: &str) -> Publisher {
        let mut publishers = self
            .inner
            .publishers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let shared = publishers
            .entry(topic.to_owned())
            .or_insert_with(|| Arc::new(PublisherShared::new(topic)))
            .clone();

        Publisher::new(self.clone(), shared)
    }

    pub fn publisher_topics(&self) -> Vec<String> {
        self.inner
            .publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn publishers_for(&self, topic: &str) -> Vec<Publisher> {
        self.inner
            .publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|shared| vec![Publisher::new(self.clone(), shared.clone())])
            .unwrap_or_default()
    }

    pub fn queue(&self, def: QueueDefinition) -> QueueConsumer {
        QueueConsumer::new(self, def)
    }

    pub fn delay_queue(&self, def: DelayQueueDefinition) -> DelayQueue {
        DelayQueue::new(self, def)
    }

    /// Replaces the fallback store used by publishers with a `Buffer` policy.
    pub fn set_fallback_adapter(&self, adapter: Arc<dyn FallbackAdapter>) -> &Self {
        *self
            .inner
            .fallback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = adapter;
        self
    }

    pub fn fallback_adapter(&self) -> Arc<dyn FallbackAdapter> {
        self.inner
            .fallback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Keeps a message that could not be published for later replay.
    pub async fn store_fallback(&self, topic: &str, message: Message) -> PublishResult {
        self.start();
        self.fallback_adapter()
            .store(FallbackEntry {
                topic: topic.to_owned(),
                message,
            })
            .await
    }

    /// Closes every cached channel and the broker connection, and stops the
    /// supervisor. Pending and future channel requests fail.
    pub async fn close(&self) {
        self.inner.registry.close_all().await;
        self.inner.supervisor.shutdown().await;
        info!("connection closed");
    }

    /// Closes the connection when the process receives Ctrl-C.
    pub fn shutdown_on_ctrl_c(&self) -> JoinHandle<()> {
        let connection = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, closing the connection");
                connection.close().await;
            }
        })
    }

    pub(crate) fn start(&self) {
        self.inner.supervisor.start();

        if self.inner.replaying.swap(true, Ordering::SeqCst) {
            return;
        }

        tokio::spawn(replay_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.fallback_replay_interval,
        ));
    }

    fn replay_targets(&self, topic: &str) -> Vec<Arc<dyn ReplayTarget>> {
        self.publishers_for(topic)
            .into_iter()
            .map(|publisher| Arc::new(publisher) as Arc<dyn ReplayTarget>)
            .collect()
    }
}

/// Drains the fallback store on every tick while the connection is up.
/// A single task drains, so passes never overlap.
async fn replay_loop(inner: std::sync::Weak<Inner>, every: Duration) {
    let mut ticker = time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let connection = Connection { inner };

        match connection.state() {
            ConnectionState::Connected => {}
            state if state.is_terminal() => break,
            _ => continue,
        }

        let adapter = connection.fallback_adapter();
        fallback::replay_pending(adapter.as_ref(), |topic| connection.replay_targets(topic)).await;
    }

    debug!("fallback replay stopped");
}
