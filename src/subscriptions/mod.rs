//! Rule-scoped subscriptions to the stream.
//!
//! Each subscription pairs one rule with a private, bounded event channel.
//! The manager delivers an event to every subscription whose rule id the
//! server reported as matched, and reports rules that lose their last
//! subscriber so they can be removed upstream.
//!
//! # Example
//!
//! ```ignore
//! let rule = client.create_rule("cats has:images")?;
//! let sub = client.subscribe(rule);
//!
//! for event in sub.receiver().clone() {
//!     println!("@{}: {}", event.author.handle, event.text);
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    DeliveryOutcome, DeliveryPolicy, Subscription, SubscriptionConfig, SubscriptionId,
};
