//! In-memory transport.
//!
//! Serves the rule endpoints from a local rule table (with the server's
//! duplicate-rule behavior) and streams whatever records are pushed into it
//! over a cancellable pipe. Connection opens, releases and cancellations are
//! counted so tests can observe the pump's resource handling.

use super::{CancelStream, RawResponse, StreamBody, Transport};
use crate::error::{Result, StreamError};
use crate::types::{Rule, RuleId};
use crossbeam_channel::{select, unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// First id handed out; mirrors the 19-digit ids of the real API.
const FIRST_RULE_ID: u64 = 1_500_000_000_000_000_001;

#[derive(Default)]
struct ConnectionStats {
    opened: AtomicUsize,
    released: AtomicUsize,
    cancelled: AtomicUsize,
}

struct MemoryState {
    rules: Vec<Rule>,
    next_id: u64,
    feed: Option<Sender<Vec<u8>>>,
    open_error: Option<String>,
    create_failure: Option<(u16, String)>,
    delete_failure: Option<(u16, String)>,
    list_failure: Option<(u16, String)>,
    delete_log: Vec<Vec<RuleId>>,
}

/// Scriptable in-process stand-in for the upstream API.
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    stats: Arc<ConnectionStats>,
    opened_tx: Sender<()>,
    opened_rx: Receiver<()>,
    deletes_tx: Sender<Vec<RuleId>>,
    deletes_rx: Receiver<Vec<RuleId>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (opened_tx, opened_rx) = unbounded();
        let (deletes_tx, deletes_rx) = unbounded();
        Self {
            state: Mutex::new(MemoryState {
                rules: Vec::new(),
                next_id: FIRST_RULE_ID,
                feed: None,
                open_error: None,
                create_failure: None,
                delete_failure: None,
                list_failure: None,
                delete_log: Vec::new(),
            }),
            stats: Arc::new(ConnectionStats::default()),
            opened_tx,
            opened_rx,
            deletes_tx,
            deletes_rx,
        }
    }

    // --- Rule table ---

    /// Register a rule directly, bypassing the request path.
    pub fn insert_rule(&self, expression: &str) -> Rule {
        let mut state = self.state.lock();
        Self::add_rule(&mut state, expression)
    }

    /// Rules currently registered.
    pub fn rules(&self) -> Vec<Rule> {
        self.state.lock().rules.clone()
    }

    /// Every delete request received so far, in arrival order.
    pub fn delete_requests(&self) -> Vec<Vec<RuleId>> {
        self.state.lock().delete_log.clone()
    }

    /// Wait for the next delete request.
    pub fn wait_for_delete(&self, timeout: Duration) -> Option<Vec<RuleId>> {
        self.deletes_rx.recv_timeout(timeout).ok()
    }

    /// Answer every create request with the given status and body.
    pub fn fail_creates(&self, status: u16, body: &str) {
        self.state.lock().create_failure = Some((status, body.to_string()));
    }

    /// Answer every delete request with the given status and body.
    pub fn fail_deletes(&self, status: u16, body: &str) {
        self.state.lock().delete_failure = Some((status, body.to_string()));
    }

    /// Answer every list request with the given status and body.
    pub fn fail_lists(&self, status: u16, body: &str) {
        self.state.lock().list_failure = Some((status, body.to_string()));
    }

    // --- Stream ---

    /// Make subsequent stream opens fail.
    pub fn fail_stream_open(&self, message: &str) {
        self.state.lock().open_error = Some(message.to_string());
    }

    /// Wait until the next stream connection is opened.
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.opened_rx.recv_timeout(timeout).is_ok()
    }

    /// Push one JSON record onto the open stream. Returns false if no stream is open.
    pub fn push_record(&self, record: &Value) -> bool {
        let mut bytes = record.to_string().into_bytes();
        bytes.extend_from_slice(b"\r\n");
        self.push_raw(bytes)
    }

    /// Push raw bytes onto the open stream. Returns false if no stream is open.
    pub fn push_raw(&self, bytes: impl Into<Vec<u8>>) -> bool {
        let state = self.state.lock();
        match &state.feed {
            Some(feed) => feed.send(bytes.into()).is_ok(),
            None => false,
        }
    }

    /// Close the open stream from the server side.
    pub fn end_stream(&self) {
        self.state.lock().feed = None;
    }

    pub fn connections_opened(&self) -> usize {
        self.stats.opened.load(Ordering::SeqCst)
    }

    pub fn connections_released(&self) -> usize {
        self.stats.released.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet released.
    pub fn active_connections(&self) -> usize {
        self.connections_opened().saturating_sub(self.connections_released())
    }

    pub fn cancellations(&self) -> usize {
        self.stats.cancelled.load(Ordering::SeqCst)
    }

    // --- Request handling ---

    fn add_rule(state: &mut MemoryState, expression: &str) -> Rule {
        let rule = Rule::with_id(state.next_id, expression);
        state.next_id += 1;
        state.rules.push(rule.clone());
        rule
    }

    fn handle_add(&self, additions: &[Value]) -> RawResponse {
        let mut state = self.state.lock();
        if let Some((status, body)) = &state.create_failure {
            return RawResponse::new(*status, body.clone());
        }

        let mut created = Vec::new();
        let mut errors = Vec::new();
        for addition in additions {
            let Some(expression) = addition.get("value").and_then(Value::as_str) else {
                return RawResponse::new(400, r#"{"title":"Invalid Request"}"#);
            };
            let existing = state
                .rules
                .iter()
                .find(|r| r.expression == expression)
                .cloned();
            match existing {
                Some(existing) => errors.push(json!({
                    "id": existing.id,
                    "value": existing.expression,
                    "title": "DuplicateRule",
                })),
                None => created.push(Self::add_rule(&mut state, expression)),
            }
        }

        let mut body = json!({
            "meta": {
                "summary": {
                    "created": created.len(),
                    "not_created": errors.len(),
                }
            }
        });
        if !created.is_empty() {
            body["data"] = json!(created);
        }
        if !errors.is_empty() {
            body["errors"] = json!(errors);
        }
        RawResponse::new(201, body.to_string())
    }

    fn handle_delete(&self, ids: &[Value]) -> RawResponse {
        let ids: Vec<RuleId> = ids
            .iter()
            .filter_map(|id| serde_json::from_value(id.clone()).ok())
            .collect();

        let mut state = self.state.lock();
        state.delete_log.push(ids.clone());
        let _ = self.deletes_tx.send(ids.clone());

        if let Some((status, body)) = &state.delete_failure {
            return RawResponse::new(*status, body.clone());
        }

        let before = state.rules.len();
        state
            .rules
            .retain(|r| r.id.as_ref().map_or(true, |id| !ids.contains(id)));
        let deleted = before - state.rules.len();

        let body = json!({
            "meta": {
                "summary": {
                    "deleted": deleted,
                    "not_deleted": ids.len() - deleted,
                }
            }
        });
        RawResponse::new(200, body.to_string())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn open_stream(&self) -> Result<StreamBody> {
        let mut state = self.state.lock();
        if let Some(message) = &state.open_error {
            return Err(StreamError::Transport(message.clone()));
        }

        let (feed_tx, feed_rx) = unbounded();
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(0);
        state.feed = Some(feed_tx);
        drop(state);

        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        let _ = self.opened_tx.send(());

        let reader = PipeReader {
            chunks: feed_rx,
            cancelled: cancel_rx,
            pending: Vec::new(),
            pos: 0,
            stats: Arc::clone(&self.stats),
        };
        let canceller = PipeCanceller {
            trigger: Mutex::new(Some(cancel_tx)),
            stats: Arc::clone(&self.stats),
        };
        Ok(StreamBody::new(reader, canceller))
    }

    fn get_rules(&self) -> Result<RawResponse> {
        let state = self.state.lock();
        if let Some((status, body)) = &state.list_failure {
            return Ok(RawResponse::new(*status, body.clone()));
        }
        let mut body = json!({ "meta": { "result_count": state.rules.len() } });
        if !state.rules.is_empty() {
            body["data"] = json!(state.rules);
        }
        Ok(RawResponse::new(200, body.to_string()))
    }

    fn post_rules(&self, body: &[u8]) -> Result<RawResponse> {
        let request: Value = serde_json::from_slice(body)?;
        if let Some(additions) = request.get("add").and_then(Value::as_array) {
            return Ok(self.handle_add(additions));
        }
        if let Some(ids) = request
            .get("delete")
            .and_then(|d| d.get("ids"))
            .and_then(Value::as_array)
        {
            return Ok(self.handle_delete(ids));
        }
        Ok(RawResponse::new(400, r#"{"title":"Invalid Request"}"#))
    }
}

/// Read half of the in-memory connection.
struct PipeReader {
    chunks: Receiver<Vec<u8>>,
    cancelled: Receiver<()>,
    pending: Vec<u8>,
    pos: usize,
    stats: Arc<ConnectionStats>,
}

impl PipeReader {
    fn aborted() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionAborted, "stream request cancelled")
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if matches!(self.cancelled.try_recv(), Err(TryRecvError::Disconnected)) {
            return Err(Self::aborted());
        }

        while self.pos >= self.pending.len() {
            select! {
                recv(self.chunks) -> chunk => match chunk {
                    Ok(chunk) => {
                        self.pending = chunk;
                        self.pos = 0;
                    }
                    Err(_) => return Ok(0),
                },
                recv(self.cancelled) -> _ => return Err(Self::aborted()),
            }
        }

        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct PipeCanceller {
    trigger: Mutex<Option<Sender<()>>>,
    stats: Arc<ConnectionStats>,
}

impl CancelStream for PipeCanceller {
    fn cancel(&self) {
        if self.trigger.lock().take().is_some() {
            self.stats.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}
