// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Registry
//!
//! Named channels are cached per connection. The cache is owned by a single
//! task; callers talk to it through commands, so concurrent requests for the
//! same name always share one creation and one channel.
//!
//! A cached channel is dropped when it reports closure, when it was created on
//! an older connection generation, or when it says it is no longer open.

use crate::{
    connection::Supervisor,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    transport::{BrokerChannel, ChannelEvent},
};
use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, oneshot,
};
use tracing::{debug, warn};

type Reply = oneshot::Sender<Result<Arc<dyn BrokerChannel>, AmqpError>>;

/// A freshly created channel with the exchange already declared.
pub(crate) struct OpenedChannel {
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) events: broadcast::Receiver<ChannelEvent>,
    pub(crate) generation: u64,
}

/// Creates a channel on the current connection and declares the exchange on it.
pub(crate) async fn open_channel(
    supervisor: &Arc<Supervisor>,
    exchange: &ExchangeDefinition,
) -> Result<OpenedChannel, AmqpError> {
    let (connection, generation) = supervisor.connected().await?;
    let channel = connection.create_channel().await?;
    let events = channel.subscribe();

    if let Err(err) = channel.declare_exchange(exchange).await {
        warn!(error = err.to_string(), exchange = exchange.name(), "failure to declare exchange");
        let _ = channel.close().await;
        return Err(err);
    }

    Ok(OpenedChannel {
        channel,
        events,
        generation,
    })
}

enum Command {
    Load {
        name: String,
        reply: Reply,
    },
    Created {
        name: String,
        result: Result<OpenedChannel, AmqpError>,
    },
    Evict {
        name: String,
        id: u64,
    },
    CloseAll {
        reply: oneshot::Sender<()>,
    },
}

enum Slot {
    Pending(Vec<Reply>),
    Ready {
        id: u64,
        generation: u64,
        channel: Arc<dyn BrokerChannel>,
    },
}

/// Handle to the registry task. The task starts with the first request.
pub(crate) struct ChannelRegistry {
    supervisor: Arc<Supervisor>,
    exchange: ExchangeDefinition,
    commands: OnceLock<mpsc::UnboundedSender<Command>>,
}

impl ChannelRegistry {
    pub(crate) fn new(supervisor: Arc<Supervisor>, exchange: ExchangeDefinition) -> ChannelRegistry {
        ChannelRegistry {
            supervisor,
            exchange,
            commands: OnceLock::new(),
        }
    }

    pub(crate) async fn load(&self, name: &str) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let (reply, response) = oneshot::channel();

        self.sender()
            .send(Command::Load {
                name: name.to_owned(),
                reply,
            })
            .map_err(|_| AmqpError::ConnectionClosed)?;

        response.await.map_err(|_| AmqpError::ConnectionClosed)?
    }

    /// Closes every cached channel. Later loads fail with `ConnectionClosed`.
    pub(crate) async fn close_all(&self) {
        let (reply, done) = oneshot::channel();

        if self.sender().send(Command::CloseAll { reply }).is_ok() {
            let _ = done.await;
        }
    }

    fn sender(&self) -> &mpsc::UnboundedSender<Command> {
        self.commands.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let actor = RegistryActor {
                supervisor: self.supervisor.clone(),
                exchange: self.exchange.clone(),
                commands: tx.downgrade(),
                slots: HashMap::new(),
                next_id: 0,
                closed: false,
            };
            tokio::spawn(actor.run(rx));
            tx
        })
    }
}

struct RegistryActor {
    supervisor: Arc<Supervisor>,
    exchange: ExchangeDefinition,
    commands: mpsc::WeakUnboundedSender<Command>,
    slots: HashMap<String, Slot>,
    next_id: u64,
    closed: bool,
}

impl RegistryActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut link = self.supervisor.subscribe();
        let mut watching = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                changed = link.changed(), if watching => match changed {
                    Ok(()) => {
                        let generation = link.borrow_and_update().generation;
                        self.evict_stale(generation);
                    }
                    Err(_) => watching = false,
                },
            }
        }

        debug!("channel registry stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Load { name, reply } => self.load(name, reply),
            Command::Created { name, result } => self.created(name, result).await,
            Command::Evict { name, id } => self.evict(&name, id),
            Command::CloseAll { reply } => {
                self.close_all().await;
                let _ = reply.send(());
            }
        }
    }

    fn load(&mut self, name: String, reply: Reply) {
        if self.closed {
            let _ = reply.send(Err(AmqpError::ConnectionClosed));
            return;
        }

        let current = self.supervisor.generation();

        match self.slots.get_mut(&name) {
            Some(Slot::Ready {
                generation,
                channel,
                ..
            }) if *generation == current && channel.is_open() => {
                let _ = reply.send(Ok(channel.clone()));
                return;
            }
            Some(Slot::Pending(waiters)) => {
                waiters.push(reply);
                return;
            }
            Some(Slot::Ready { .. }) => {
                debug!(channel = name.as_str(), "cached channel is stale, recreating");
            }
            None => {}
        }

        self.slots.insert(name.clone(), Slot::Pending(vec![reply]));
        self.spawn_creation(name);
    }

    fn spawn_creation(&self, name: String) {
        let supervisor = self.supervisor.clone();
        let exchange = self.exchange.clone();
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let result = open_channel(&supervisor, &exchange).await;

            match commands.upgrade() {
                Some(commands) => {
                    let _ = commands.send(Command::Created { name, result });
                }
                None => {
                    if let Ok(opened) = result {
                        let _ = opened.channel.close().await;
                    }
                }
            }
        });
    }

    async fn created(&mut self, name: String, result: Result<OpenedChannel, AmqpError>) {
        let waiters = match self.slots.remove(&name) {
            Some(Slot::Pending(waiters)) if !waiters.is_empty() => waiters,
            slot => {
                if let Some(ready @ Slot::Ready { .. }) = slot {
                    self.slots.insert(name, ready);
                }

                // Nobody waits for it anymore (the registry was closed meanwhile).
                if let Ok(opened) = result {
                    let _ = opened.channel.close().await;
                }
                return;
            }
        };

        match result {
            Ok(opened) => {
                let id = self.next_id;
                self.next_id += 1;

                debug!(channel = name.as_str(), generation = opened.generation, "channel created");
                self.watch(name.clone(), id, opened.events);

                for waiter in waiters {
                    let _ = waiter.send(Ok(opened.channel.clone()));
                }

                self.slots.insert(
                    name,
                    Slot::Ready {
                        id,
                        generation: opened.generation,
                        channel: opened.channel,
                    },
                );
            }
            Err(err) => {
                warn!(error = err.to_string(), channel = name.as_str(), "failure to create channel");
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }

    /// Evicts the slot once its channel reports closure.
    fn watch(&self, name: String, id: u64, mut events: broadcast::Receiver<ChannelEvent>) {
        let commands = self.commands.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Drain) | Err(RecvError::Lagged(_)) => continue,
                    Ok(ChannelEvent::Error(err)) => {
                        warn!(error = err.as_str(), channel = name.as_str(), "channel error");
                        break;
                    }
                    Ok(ChannelEvent::Closed) | Err(RecvError::Closed) => break,
                }
            }

            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Evict { name, id });
            }
        });
    }

    fn evict(&mut self, name: &str, id: u64) {
        let current = matches!(
            self.slots.get(name),
            Some(Slot::Ready { id: cached, .. }) if *cached == id
        );

        if current {
            debug!(channel = name, "channel closed, removed from cache");
            self.slots.remove(name);
        }
    }

    fn evict_stale(&mut self, generation: u64) {
        self.slots.retain(|_, slot| match slot {
            Slot::Ready {
                generation: created,
                ..
            } => *created >= generation,
            Slot::Pending(_) => true,
        });
    }

    async fn close_all(&mut self) {
        self.closed = true;

        for (name, slot) in self.slots.drain() {
            match slot {
                Slot::Ready { channel, .. } => {
                    if let Err(err) = channel.close().await {
                        debug!(error = err.to_string(), channel = name.as_str(), "failure to close channel");
                    }
                }
                Slot::Pending(waiters) => {
                    for waiter in waiters {
                        let _ = waiter.send(Err(AmqpError::ConnectionClosed));
                    }
                }
            }
        }
    }
}
