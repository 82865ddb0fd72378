//! Fan-out of committed line changes to live subscribers.
//!
//! The [`Broadcaster`] is registered with the pin manager as an observer and
//! copies every committed change straight into each subscriber's private
//! ring, on the writer's thread and without blocking. A ring keeps the most
//! recent `queue_capacity` events: a subscriber that falls behind loses the
//! oldest ones and is told how many it missed, without slowing the writer or
//! any other subscriber. Nothing sits between the writer and the rings, so
//! every loss is reported to the subscriber that suffered it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use log::{debug, info};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use crate::gpio::{ChangeEvent, ChangeObserver};

pub type SubscriberId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Active,
    Closing,
    Closed,
}

#[derive(Debug)]
struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn new() -> Self {
        Self(AtomicU8::new(SubscriberState::Active as u8))
    }

    fn get(&self) -> SubscriberState {
        match self.0.load(Ordering::Acquire) {
            0 => SubscriberState::Active,
            1 => SubscriberState::Closing,
            _ => SubscriberState::Closed,
        }
    }

    fn set(&self, state: SubscriberState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// What a subscriber pulls off its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event(ChangeEvent),
    /// This many events were overwritten before they could be delivered.
    Lagged(u64),
}

/// Receiving end of one subscription.
pub struct Subscriber {
    id: SubscriberId,
    lifecycle: Arc<Lifecycle>,
    events: broadcast::Receiver<ChangeEvent>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn state(&self) -> SubscriberState {
        self.lifecycle.get()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriberState::Active
    }

    /// Waits for the next delivery. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        if !self.is_active() {
            return None;
        }
        match self.events.recv().await {
            Ok(event) if self.is_active() => Some(Delivery::Event(event)),
            Ok(_) | Err(RecvError::Closed) => None,
            Err(RecvError::Lagged(n)) => Some(Delivery::Lagged(n)),
        }
    }

    /// Non-blocking variant of [`Subscriber::recv`]; `None` when nothing is
    /// queued.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        if !self.is_active() {
            return None;
        }
        match self.events.try_recv() {
            Ok(event) => Some(Delivery::Event(event)),
            Err(TryRecvError::Lagged(n)) => Some(Delivery::Lagged(n)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Stream of deliveries that ends when the subscription is closed.
    pub fn into_stream(self) -> impl Stream<Item = Delivery> + Send + 'static {
        let lifecycle = self.lifecycle;
        BroadcastStream::new(self.events)
            .take_while(move |_| lifecycle.get() == SubscriberState::Active)
            .map(|item| match item {
                Ok(event) => Delivery::Event(event),
                Err(BroadcastStreamRecvError::Lagged(n)) => Delivery::Lagged(n),
            })
    }
}

struct SubscriberEntry {
    sender: broadcast::Sender<ChangeEvent>,
    lifecycle: Arc<Lifecycle>,
}

pub struct Broadcaster {
    subscribers: RwLock<FxHashMap<SubscriberId, SubscriberEntry>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// New subscribers only see events published after this call.
    pub fn subscribe(&self) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, events) = broadcast::channel(self.queue_capacity);
        let lifecycle = Arc::new(Lifecycle::new());

        self.subscribers.write().insert(
            id,
            SubscriberEntry {
                sender,
                lifecycle: lifecycle.clone(),
            },
        );
        info!("subscriber {id} connected");

        Subscriber {
            id,
            lifecycle,
            events,
        }
    }

    /// Returns false if `id` was not subscribed. Anything still queued for the
    /// subscriber is abandoned.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        if let Some(entry) = self.subscribers.read().get(&id) {
            entry.lifecycle.set(SubscriberState::Closing);
        }

        let Some(entry) = self.subscribers.write().remove(&id) else {
            return false;
        };
        entry.lifecycle.set(SubscriberState::Closed);
        info!("subscriber {id} disconnected");
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Enqueues `event` for every active subscriber and returns how many
    /// accepted it. Subscribers whose receiving end is gone are removed.
    pub fn fan_out(&self, event: &ChangeEvent) -> usize {
        let mut vanished = Vec::new();
        let mut delivered = 0;
        {
            let subscribers = self.subscribers.read();
            for (id, entry) in subscribers.iter() {
                if entry.lifecycle.get() != SubscriberState::Active {
                    continue;
                }
                match entry.sender.send(event.clone()) {
                    Ok(_) => delivered += 1,
                    Err(_) => vanished.push(*id),
                }
            }
        }

        if !vanished.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in vanished {
                if let Some(entry) = subscribers.remove(&id) {
                    entry.lifecycle.set(SubscriberState::Closed);
                    debug!("subscriber {id} went away, removed");
                }
            }
        }

        debug!(
            "line {} -> {} delivered to {delivered} subscribers",
            event.line_id, event.value
        );
        delivered
    }

    /// Closes every subscription; their streams end.
    pub fn close_all(&self) {
        let closed: Vec<_> = self.subscribers.write().drain().collect();
        for (_, entry) in &closed {
            entry.lifecycle.set(SubscriberState::Closed);
        }
        if !closed.is_empty() {
            info!("closed {} subscribers", closed.len());
        }
    }
}

impl ChangeObserver for Broadcaster {
    fn on_change(&self, event: &ChangeEvent) {
        self.fan_out(event);
    }
}
