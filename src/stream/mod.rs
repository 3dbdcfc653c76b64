//! The streaming side of the client.
//!
//! - [`StreamPump`] keeps one connection open, decodes records and fans
//!   events out to subscribers.
//! - [`StreamController`] starts a pump on demand and stops it again, making
//!   sure at most one runs at a time.
//! - [`decode`] turns raw stream records into [`Event`](crate::Event)s.

pub mod decode;
mod lifecycle;
mod pump;

pub use lifecycle::{PumpState, StreamController, StreamLifecycle};
pub use pump::{StopReason, StreamPump};
