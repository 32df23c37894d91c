// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Fallback Storage
//!
//! Messages that cannot be published are handed to a [`FallbackAdapter`] and
//! replayed once the broker is reachable again. Replay is FIFO per adapter and
//! stops at the first failure, putting the unsent entries back in front.

use crate::{
    errors::AmqpError,
    message::{Message, PublishResult},
};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, warn};

/// A message waiting to be published to `topic`.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackEntry {
    pub topic: String,
    pub message: Message,
}

/// Local storage for undeliverable messages.
#[async_trait]
pub trait FallbackAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn store(&self, entry: FallbackEntry) -> PublishResult;

    /// Removes and returns every stored entry, oldest first.
    async fn snapshot(&self) -> Vec<FallbackEntry>;

    /// Puts entries back in front of the store, keeping their order.
    async fn restore(&self, entries: Vec<FallbackEntry>);

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub const MEMORY_FALLBACK: &str = "memory";
/// Entries kept by [`MemoryFallback::default`] before the oldest is dropped.
pub const DEFAULT_FALLBACK_CAPACITY: usize = 10_000;

/// In-process fallback store. Contents are lost when the process exits.
pub struct MemoryFallback {
    entries: Mutex<VecDeque<FallbackEntry>>,
    max_items: Option<usize>,
}

impl Default for MemoryFallback {
    /// Bounded to [`DEFAULT_FALLBACK_CAPACITY`] entries.
    fn default() -> Self {
        MemoryFallback::bounded(DEFAULT_FALLBACK_CAPACITY)
    }
}

impl MemoryFallback {
    /// Bounded store; once full the oldest entry is dropped.
    pub fn bounded(max_items: usize) -> MemoryFallback {
        MemoryFallback {
            entries: Mutex::new(VecDeque::new()),
            max_items: Some(max_items),
        }
    }

    /// Keeps every entry until it is replayed.
    pub fn unbounded() -> MemoryFallback {
        MemoryFallback {
            entries: Mutex::new(VecDeque::new()),
            max_items: None,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, VecDeque<FallbackEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl FallbackAdapter for MemoryFallback {
    fn name(&self) -> &str {
        MEMORY_FALLBACK
    }

    async fn store(&self, entry: FallbackEntry) -> PublishResult {
        let mut entries = self.entries();

        if let Some(max) = self.max_items {
            while max > 0 && entries.len() >= max {
                if let Some(dropped) = entries.pop_front() {
                    warn!(topic = dropped.topic.as_str(), "fallback store full, dropping oldest message");
                }
            }
        }

        debug!(topic = entry.topic.as_str(), "message kept for replay");
        entries.push_back(entry);

        PublishResult::Buffered {
            adapter: MEMORY_FALLBACK.to_owned(),
        }
    }

    async fn snapshot(&self) -> Vec<FallbackEntry> {
        self.entries().drain(..).collect()
    }

    async fn restore(&self, entries: Vec<FallbackEntry>) {
        let mut stored = self.entries();
        for entry in entries.into_iter().rev() {
            stored.push_front(entry);
        }
    }

    async fn len(&self) -> usize {
        self.entries().len()
    }
}

/// Something able to publish a replayed message. Implemented by publishers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReplayTarget: Send + Sync {
    async fn deliver(&self, message: &Message) -> Result<(), AmqpError>;
}

/// Replays the stored entries in order.
///
/// Entries whose topic has no registered publisher are dropped with a warning.
/// On the first delivery failure the failed entry and everything after it go
/// back to the store. Returns the number of delivered entries.
pub async fn replay_pending<F>(adapter: &dyn FallbackAdapter, resolve: F) -> usize
where
    F: Fn(&str) -> Vec<Arc<dyn ReplayTarget>>,
{
    let mut pending: VecDeque<FallbackEntry> = adapter.snapshot().await.into();
    if pending.is_empty() {
        return 0;
    }

    debug!(adapter = adapter.name(), pending = pending.len(), "replaying fallback messages");
    let mut delivered = 0;

    while let Some(entry) = pending.pop_front() {
        let targets = resolve(&entry.topic);
        if targets.is_empty() {
            warn!(topic = entry.topic.as_str(), "no publisher registered, discarding fallback message");
            continue;
        }

        let mut failure = None;
        for target in &targets {
            if let Err(err) = target.deliver(&entry.message).await {
                failure = Some(err);
                break;
            }
        }

        if let Some(err) = failure {
            warn!(
                error = err.to_string(),
                topic = entry.topic.as_str(),
                remaining = pending.len() + 1,
                "fallback replay interrupted"
            );
            pending.push_front(entry);
            adapter.restore(pending.into()).await;
            return delivered;
        }

        delivered += 1;
    }

    debug!(delivered, "fallback replay finished");
    delivered
}
