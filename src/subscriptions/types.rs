//! Subscription types.

use crate::types::{Event, Rule};
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;

/// How fan-out behaves when a subscriber's buffer is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Wait until the subscriber makes room. A subscriber that stops reading
    /// stalls delivery to everyone else.
    #[default]
    Block,
    /// Wait at most this long, then skip the event for that subscriber.
    Timeout(Duration),
}

/// Configuration for the subscription manager.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Events buffered per subscriber before delivery waits.
    /// Default: 32
    pub buffer_size: usize,

    /// What to do when a subscriber's buffer is full.
    pub delivery: DeliveryPolicy,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 32,
            delivery: DeliveryPolicy::Block,
        }
    }
}

/// Result of handing one event to one subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The subscriber is unsubscribing or its receiver is gone.
    Closed,
    /// The timeout policy gave up on a full buffer.
    TimedOut,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A caller's interest in one rule, with its private event channel.
///
/// Events arrive in stream order. After unsubscribing, already buffered
/// events can still be read; then the channel reports disconnection.
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) rule: Rule,
    pub(crate) receiver: Receiver<Event>,
    /// Dropped on unsubscribe to abort a delivery blocked on this subscriber.
    pub(crate) closing: Mutex<Option<Sender<()>>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// The underlying channel; clone it to consume events on another thread.
    pub fn receiver(&self) -> &Receiver<Event> {
        &self.receiver
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<Event, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<Event, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Blocking iterator over events; ends when the channel is closed.
    pub fn iter(&self) -> crossbeam_channel::Iter<'_, Event> {
        self.receiver.iter()
    }

    /// Signal that this subscription is going away.
    pub(crate) fn begin_close(&self) {
        self.closing.lock().take();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("rule", &self.rule)
            .finish()
    }
}
