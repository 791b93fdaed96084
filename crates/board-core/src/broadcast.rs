//! Event fan-out to live subscribers.
//!
//! All events flow through one `tokio::sync::broadcast` sender, so every
//! subscriber observes them in the same order they were published. A
//! subscriber that falls behind by more than the channel capacity loses the
//! oldest events and keeps going; it never slows down the publisher or the
//! other subscribers.

use board_protocol::ServerEvent;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// A subscriber identifier, one per live connection.
pub type SubscriberId = String;

/// Broadcaster errors.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// The id is already registered.
    #[error("Already subscribed: {0}")]
    AlreadySubscribed(SubscriberId),

    /// The subscriber limit is reached.
    #[error("Maximum subscribers reached ({0})")]
    MaxSubscribersReached(usize),
}

/// Broadcaster configuration.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Events buffered per subscriber before the oldest are dropped.
    pub capacity: usize,
    /// Maximum number of registered subscribers.
    pub max_subscribers: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_subscribers: 10_000,
        }
    }
}

#[derive(Debug)]
struct SubscriberEntry {
    subscribed_at: Instant,
    active: Arc<AtomicBool>,
}

/// Registered subscribers, shared with every [`Subscription`].
#[derive(Debug, Default)]
struct Registry {
    subscribers: DashMap<SubscriberId, SubscriberEntry>,
    // Slots reserved against `max_subscribers`; taken before an entry is
    // inserted so concurrent subscribes cannot overshoot the cap.
    reserved: AtomicUsize,
}

impl Registry {
    /// Remove `id`, but only if it still belongs to `active` when given.
    fn remove(&self, id: &str, owner: Option<&Arc<AtomicBool>>) -> Option<SubscriberEntry> {
        let removed = match owner {
            Some(active) => self
                .subscribers
                .remove_if(id, |_, entry| Arc::ptr_eq(&entry.active, active)),
            None => self.subscribers.remove(id),
        };

        removed.map(|(_, entry)| {
            entry.active.store(false, Ordering::Release);
            self.reserved.fetch_sub(1, Ordering::AcqRel);
            entry
        })
    }
}

/// The live subscriber registry and event fan-out.
pub struct Broadcaster {
    sender: broadcast::Sender<Arc<ServerEvent>>,
    registry: Arc<Registry>,
    published: AtomicU64,
    config: BroadcastConfig,
}

impl Broadcaster {
    /// Create a broadcaster with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BroadcastConfig::default())
    }

    /// Create a broadcaster with custom configuration.
    #[must_use]
    pub fn with_config(config: BroadcastConfig) -> Self {
        info!("Creating broadcaster with config: {:?}", config);
        let (sender, _) = broadcast::channel(config.capacity.max(1));
        Self {
            sender,
            registry: Arc::new(Registry::default()),
            published: AtomicU64::new(0),
            config,
        }
    }

    /// Register a subscriber.
    ///
    /// The returned [`Subscription`] receives every event published while
    /// it stays registered. Dropping it, or calling
    /// [`Broadcaster::unsubscribe`], removes the registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is taken or the subscriber limit is reached.
    pub fn subscribe(&self, id: impl Into<SubscriberId>) -> Result<Subscription, BroadcastError> {
        let id = id.into();
        let max = self.config.max_subscribers;

        if self
            .registry
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            return Err(BroadcastError::MaxSubscribersReached(max));
        }

        let active = Arc::new(AtomicBool::new(true));
        match self.registry.subscribers.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.registry.reserved.fetch_sub(1, Ordering::AcqRel);
                Err(BroadcastError::AlreadySubscribed(id))
            }
            Entry::Vacant(slot) => {
                // Receiver attached under the entry guard: nothing published
                // after registration can be missed
                let receiver = self.sender.subscribe();
                slot.insert(SubscriberEntry {
                    subscribed_at: Instant::now(),
                    active: Arc::clone(&active),
                });
                debug!(subscriber = %id, "Subscribed");

                Ok(Subscription {
                    id,
                    receiver,
                    active,
                    registry: Arc::clone(&self.registry),
                    dropped: 0,
                })
            }
        }
    }

    /// Remove a subscriber.
    ///
    /// Returns `true` if it was registered. Unknown or already removed ids
    /// are ignored. The removed subscriber's [`Subscription`] yields nothing
    /// further.
    pub fn unsubscribe(&self, id: &str) -> bool {
        match self.registry.remove(id, None) {
            Some(entry) => {
                debug!(
                    subscriber = %id,
                    connected_ms = entry.subscribed_at.elapsed().as_millis() as u64,
                    "Unsubscribed"
                );
                true
            }
            None => false,
        }
    }

    /// Publish an event to every registered subscriber.
    ///
    /// Never waits on subscribers. Returns the number of registered
    /// subscribers the event was queued for.
    pub fn publish(&self, event: ServerEvent) -> usize {
        let name = event.name();
        let count = match self.sender.send(Arc::new(event)) {
            Ok(_) => self.registry.subscribers.len(),
            Err(_) => 0,
        };
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(event = name, recipients = count, "Published event");
        count
    }

    /// Check if an id is registered.
    #[must_use]
    pub fn is_subscribed(&self, id: &str) -> bool {
        self.registry.subscribers.contains_key(id)
    }

    /// Get the number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.len()
    }

    /// Check if another subscriber would be refused.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.registry.reserved.load(Ordering::Acquire) >= self.config.max_subscribers
    }

    /// Get broadcaster statistics.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            subscriber_count: self.registry.subscribers.len(),
            published_total: self.published.load(Ordering::Relaxed),
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcaster statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Number of registered subscribers.
    pub subscriber_count: usize,
    /// Events published since creation.
    pub published_total: u64,
}

/// One subscriber's view of the event stream.
///
/// Dropping it unregisters the subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: broadcast::Receiver<Arc<ServerEvent>>,
    active: Arc<AtomicBool>,
    registry: Arc<Registry>,
    dropped: u64,
}

impl Subscription {
    /// Get the subscriber id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of events skipped because this subscriber lagged.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Check if this subscription is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the broadcaster is gone or the subscriber has
    /// been unsubscribed.
    pub async fn recv(&mut self) -> Option<Arc<ServerEvent>> {
        loop {
            if !self.is_active() {
                return None;
            }
            match self.receiver.recv().await {
                Ok(event) if self.is_active() => return Some(event),
                Ok(_) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Arc<ServerEvent>> {
        loop {
            if !self.is_active() {
                return None;
            }
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(_) => return None,
            }
        }
    }

    /// Wait for the next event, giving up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Arc<ServerEvent>> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    fn record_lag(&mut self, skipped: u64) {
        self.dropped += skipped;
        warn!(subscriber = %self.id, skipped, "Subscriber lagged, events dropped");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.is_active() && self.registry.remove(&self.id, Some(&self.active)).is_some() {
            debug!(subscriber = %self.id, "Subscription dropped");
        }
    }
}
