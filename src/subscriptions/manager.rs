//! Subscription manager: the subscriber set and rule-keyed fan-out.

use crate::stream::StreamLifecycle;
use crate::types::{Event, Rule};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

use super::types::{
    DeliveryOutcome, DeliveryPolicy, Subscription, SubscriptionConfig, SubscriptionId,
};

/// Internal subscription state.
struct Subscriber {
    id: SubscriptionId,
    rule: Rule,
    sender: Sender<Event>,
    /// Disconnects when the handle starts unsubscribing.
    closing: Receiver<()>,
}

impl Subscriber {
    /// Check if the server tagged this event with our rule.
    fn wants(&self, event: &Event) -> bool {
        match &self.rule.id {
            Some(id) => event.matches(id),
            None => false,
        }
    }

    /// Hand one event to this subscriber according to `policy`.
    fn deliver(&self, event: Event, policy: DeliveryPolicy) -> DeliveryOutcome {
        let event = match self.sender.try_send(event) {
            Ok(()) => return DeliveryOutcome::Delivered,
            Err(TrySendError::Disconnected(_)) => return DeliveryOutcome::Closed,
            Err(TrySendError::Full(event)) => event,
        };

        match policy {
            DeliveryPolicy::Block => select! {
                send(self.sender, event) -> res => match res {
                    Ok(()) => DeliveryOutcome::Delivered,
                    Err(_) => DeliveryOutcome::Closed,
                },
                recv(self.closing) -> _ => DeliveryOutcome::Closed,
            },
            DeliveryPolicy::Timeout(timeout) => select! {
                send(self.sender, event) -> res => match res {
                    Ok(()) => DeliveryOutcome::Delivered,
                    Err(_) => DeliveryOutcome::Closed,
                },
                recv(self.closing) -> _ => DeliveryOutcome::Closed,
                default(timeout) => DeliveryOutcome::TimedOut,
            },
        }
    }
}

/// Owns the subscriber set.
///
/// Every mutation and every fan-out happens under one lock, so the set is
/// never seen half-updated and the orphan decision on unsubscribe is atomic
/// with the removal.
pub struct SubscriptionManager {
    /// Live subscriptions in subscription order.
    subscribers: Mutex<Vec<Subscriber>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    config: SubscriptionConfig,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    pub fn new() -> Self {
        Self::with_config(SubscriptionConfig::default())
    }

    /// Create a new subscription manager with custom buffering and delivery.
    pub fn with_config(config: SubscriptionConfig) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Add a subscriber for `rule` and make sure the stream is running.
    ///
    /// If the rule is not registered upstream yet, nothing will match it.
    pub fn subscribe(&self, rule: Rule, lifecycle: &dyn StreamLifecycle) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.config.buffer_size);
        let (closing_tx, closing_rx) = bounded(0);

        // Start under the lock so a concurrent last unsubscribe cannot stop
        // the stream after this subscriber was added.
        let mut subs = self.subscribers.lock();
        subs.push(Subscriber {
            id,
            rule: rule.clone(),
            sender,
            closing: closing_rx,
        });
        lifecycle.ensure_started();
        drop(subs);

        debug!(subscription_id = %id, rule = %rule, "subscribed");

        Subscription {
            id,
            rule,
            receiver,
            closing: Mutex::new(Some(closing_tx)),
        }
    }

    /// Remove a subscriber and close its channel.
    ///
    /// Returns the subscription's rule if no other subscriber references it
    /// any more. Stops the stream when the last subscriber leaves. Calling
    /// this again for the same subscription does nothing.
    pub fn unsubscribe(
        &self,
        subscription: &Subscription,
        lifecycle: &dyn StreamLifecycle,
    ) -> Option<Rule> {
        // A fan-out blocked on this subscriber gives up before we take the lock.
        subscription.begin_close();

        let mut subs = self.subscribers.lock();
        let index = subs.iter().position(|s| s.id == subscription.id)?;
        let removed = subs.remove(index);

        let orphaned = !subs.iter().any(|s| s.rule.id == removed.rule.id);
        if subs.is_empty() {
            debug!("no subscribers left, stopping stream");
            lifecycle.stop();
        }
        drop(subs);

        debug!(
            subscription_id = %removed.id,
            rule = %removed.rule,
            orphaned,
            "unsubscribed"
        );

        // Dropping the sender closes the subscriber's channel.
        let Subscriber { rule, .. } = removed;
        orphaned.then_some(rule)
    }

    /// Fan an event out to every subscriber whose rule it matched.
    ///
    /// Subscribers are served one after another while the lock is held, so a
    /// subscriber with a full buffer delays all the others (unless a timeout
    /// policy is configured). Returns the number of subscribers reached.
    pub fn deliver(&self, event: &Event) -> usize {
        let subs = self.subscribers.lock();
        let mut delivered = 0;

        for sub in subs.iter().filter(|s| s.wants(event)) {
            match sub.deliver(event.clone(), self.config.delivery) {
                DeliveryOutcome::Delivered => delivered += 1,
                DeliveryOutcome::Closed => {
                    trace!(subscription_id = %sub.id, "subscriber closing, event skipped");
                }
                DeliveryOutcome::TimedOut => {
                    warn!(
                        subscription_id = %sub.id,
                        event_id = %event.id,
                        "slow subscriber, event dropped"
                    );
                }
            }
        }

        trace!(event_id = %event.id, delivered, "event fanned out");
        delivered
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    /// Ids of live subscriptions, in subscription order.
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.subscribers.lock().iter().map(|s| s.id).collect()
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
