//! Transport seam between the stream core and the network.
//!
//! The core never builds HTTP requests or touches credentials. A transport
//! hands back raw status codes and bodies for the rule endpoints, and a
//! cancellable byte stream for the filtered stream endpoint.

pub mod memory;

use crate::error::Result;
use std::io::Read;

pub use memory::MemoryTransport;

/// Raw response of a request/response call.
#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as text, for error payloads.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Aborts an open stream request from another thread.
///
/// After `cancel` returns, a read blocked on the associated body must return
/// (with an error or end-of-stream). Calling it more than once is harmless.
pub trait CancelStream: Send + Sync {
    fn cancel(&self);
}

/// An open connection to the streaming endpoint.
///
/// Dropping the body releases the connection.
pub struct StreamBody {
    pub body: Box<dyn Read + Send>,
    pub canceller: Box<dyn CancelStream>,
}

impl StreamBody {
    pub fn new(body: impl Read + Send + 'static, canceller: impl CancelStream + 'static) -> Self {
        Self {
            body: Box::new(body),
            canceller: Box::new(canceller),
        }
    }
}

/// Authenticated access to the upstream API.
pub trait Transport: Send + Sync {
    /// Open the long-lived filtered stream.
    fn open_stream(&self) -> Result<StreamBody>;

    /// `GET` the rule list.
    fn get_rules(&self) -> Result<RawResponse>;

    /// `POST` a JSON body to the rule endpoint (used for both add and delete).
    fn post_rules(&self, body: &[u8]) -> Result<RawResponse>;
}
