//! Main client tying rules, subscriptions and the stream together.

use crate::error::Result;
use crate::rules::RuleRegistry;
use crate::stream::{PumpState, StreamController, StreamLifecycle, StreamPump};
use crate::subscriptions::{DeliveryPolicy, Subscription, SubscriptionConfig, SubscriptionManager};
use crate::transport::Transport;
use crate::types::{Event, Rule};
use crossbeam_channel::{bounded, Receiver};
use std::sync::Arc;

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Events buffered per subscription.
    pub subscriber_buffer: usize,

    /// Decoded events that may wait for fan-out.
    pub handoff_capacity: usize,

    /// What fan-out does when a subscriber's buffer is full.
    pub delivery: DeliveryPolicy,

    /// Also publish every decoded event, matched or not, on
    /// [`StreamClient::all_events`]. That channel must be drained, or it
    /// stalls the stream.
    pub enable_all_events: bool,

    /// Buffer of the all-events channel.
    pub all_events_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 32,
            handoff_capacity: 1,
            delivery: DeliveryPolicy::Block,
            enable_all_events: false,
            all_events_buffer: 64,
        }
    }
}

/// Client for a rule-filtered event stream.
///
/// Provides:
/// - Rule management (create, list, delete)
/// - Rule-scoped subscriptions backed by one shared stream connection
/// - Lazy start of the connection on first subscription and shutdown when
///   the last subscription goes away
pub struct StreamClient {
    config: ClientConfig,
    rules: Arc<RuleRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    controller: StreamController,
    all_events: Option<Receiver<Event>>,
}

impl StreamClient {
    /// Create a client with default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let rules = Arc::new(RuleRegistry::new(Arc::clone(&transport)));
        let subscriptions = Arc::new(SubscriptionManager::with_config(SubscriptionConfig {
            buffer_size: config.subscriber_buffer,
            delivery: config.delivery,
        }));

        let (all_tx, all_rx) = if config.enable_all_events {
            let (tx, rx) = bounded(config.all_events_buffer);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let pump = StreamPump::new(
            transport,
            Arc::clone(&subscriptions),
            all_tx,
            config.handoff_capacity,
        );

        Self {
            config,
            rules,
            subscriptions,
            controller: StreamController::new(pump),
            all_events: all_rx,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // --- Rule Operations ---

    /// All rules currently registered upstream.
    pub fn list_rules(&self) -> Result<Vec<Rule>> {
        self.rules.list_rules()
    }

    /// Register a rule; returns the existing rule if the expression is already registered.
    pub fn create_rule(&self, expression: &str) -> Result<Rule> {
        self.rules.create_rule(expression)
    }

    /// Register a rule from space-joined filter terms.
    pub fn create_rule_from_terms<I, S>(&self, terms: I) -> Result<Rule>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.rules.create_rule_from_terms(terms)
    }

    pub fn delete_rule(&self, rule: &Rule) -> Result<()> {
        self.rules.delete_rule(rule)
    }

    pub fn delete_rules(&self, rules: &[Rule]) -> Result<()> {
        self.rules.delete_rules(rules)
    }

    // --- Subscriptions ---

    /// Subscribe to events matching `rule`, starting the stream if needed.
    pub fn subscribe(&self, rule: Rule) -> Subscription {
        self.subscriptions.subscribe(rule, &self.controller)
    }

    /// End a subscription and close its channel.
    ///
    /// If no other subscription uses the rule, it is deleted upstream in the
    /// background. The stream stops when the last subscription is gone.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        if let Some(orphaned) = self.subscriptions.unsubscribe(subscription, &self.controller) {
            self.rules.delete_in_background(orphaned);
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }

    /// Every decoded event regardless of rule, if enabled in the config.
    pub fn all_events(&self) -> Option<&Receiver<Event>> {
        self.all_events.as_ref()
    }

    // --- Stream Control ---

    /// Start streaming if not already running.
    pub fn start_stream(&self) {
        self.controller.ensure_started();
    }

    /// Ask the stream to stop without waiting. Subscriptions stay in place;
    /// the next subscribe restarts the stream.
    pub fn stop_stream(&self) {
        self.controller.stop();
    }

    /// Stop the stream and wait until its connection is released.
    ///
    /// With [`DeliveryPolicy::Block`], a subscriber whose buffer is full keeps
    /// the pump from finishing until it reads or unsubscribes.
    pub fn shutdown(&self) {
        self.controller.shutdown();
    }

    pub fn is_streaming(&self) -> bool {
        self.controller.is_running()
    }

    pub fn pump_state(&self) -> PumpState {
        self.controller.state()
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.controller.stop();
    }
}
