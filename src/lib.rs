//! # Filtered Stream
//!
//! Fans a single rule-filtered event stream out to any number of
//! subscribers, each interested in one rule.
//!
//! ## Core Concepts
//!
//! - **Rules**: Filter expressions registered upstream; the server tags each
//!   streamed post with the ids of the rules it matched
//! - **Subscriptions**: One rule plus a private event channel
//! - **Pump**: The single upstream connection, started on the first
//!   subscription and stopped when the last one leaves
//! - **Transport**: The network seam; the client never builds requests itself
//!
//! ## Example
//!
//! ```ignore
//! use filtered_stream::{StreamClient, IMAGE_FILTER};
//!
//! let client = StreamClient::new(transport);
//!
//! let rule = client.create_rule_from_terms(["cats", IMAGE_FILTER])?;
//! let sub = client.subscribe(rule);
//!
//! if let Ok(event) = sub.recv() {
//!     println!("@{}: {}", event.author.handle, event.text);
//! }
//!
//! // Closes the channel, deletes the rule upstream, stops the stream.
//! client.unsubscribe(&sub);
//! ```

pub mod client;
pub mod error;
pub mod rules;
pub mod stream;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use client::{ClientConfig, StreamClient};
pub use error::{Result, StreamError};
pub use rules::{rule_expression, RuleRegistry, EXCLUDE_RETWEETS_FILTER, IMAGE_FILTER};
pub use stream::{PumpState, StopReason, StreamController, StreamLifecycle, StreamPump};
pub use subscriptions::{
    DeliveryOutcome, DeliveryPolicy, Subscription, SubscriptionConfig, SubscriptionId,
    SubscriptionManager,
};
pub use transport::{CancelStream, MemoryTransport, RawResponse, StreamBody, Transport};
pub use types::*;
