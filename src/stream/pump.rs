//! The stream pump: one upstream connection, decoded and fanned out.
//!
//! A pump run uses three threads. The supervisor (the caller of
//! [`StreamPump::run`]) owns the connection's canceller and waits for either
//! a stop signal or the end of decoding. The decode thread reads one record
//! at a time and hands each event over a bounded channel to the fan-out
//! thread, which delivers it to matching subscribers. The bounded handoff
//! lets decoding run ahead of delivery by at most `handoff_capacity` events.

use crate::error::StreamError;
use crate::subscriptions::SubscriptionManager;
use crate::transport::{StreamBody, Transport};
use crate::types::Event;
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use std::fmt;
use std::io::{BufReader, Read};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

use super::decode::StreamRecord;
use super::lifecycle::PumpState;

/// Why a pump run ended.
#[derive(Debug)]
pub enum StopReason {
    /// A stop signal arrived.
    Requested,
    /// The server closed the stream.
    ConnectionClosed,
    /// Opening, reading or decoding the stream failed.
    Failed(StreamError),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stop requested"),
            StopReason::ConnectionClosed => write!(f, "connection closed"),
            StopReason::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// How the decode thread finished.
enum DecodeEnd {
    Closed,
    Failed(StreamError),
    Shutdown,
}

/// Everything a pump run needs; cheap to clone for each run.
#[derive(Clone)]
pub struct StreamPump {
    transport: Arc<dyn Transport>,
    subscriptions: Arc<SubscriptionManager>,
    all_events: Option<Sender<Event>>,
    handoff_capacity: usize,
}

impl StreamPump {
    pub fn new(
        transport: Arc<dyn Transport>,
        subscriptions: Arc<SubscriptionManager>,
        all_events: Option<Sender<Event>>,
        handoff_capacity: usize,
    ) -> Self {
        Self {
            transport,
            subscriptions,
            all_events,
            handoff_capacity: handoff_capacity.max(1),
        }
    }

    /// Run one connection to completion.
    ///
    /// `stop` fires when a message arrives or its sender is dropped. State
    /// transitions are reported through `report`. When this returns, the
    /// request has been cancelled, the connection released and both worker
    /// threads have exited.
    pub fn run(&self, stop: &Receiver<()>, report: &dyn Fn(PumpState)) -> StopReason {
        if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
            return StopReason::Requested;
        }

        let StreamBody { body, canceller } = match self.transport.open_stream() {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to open stream");
                return StopReason::Failed(e);
            }
        };
        report(PumpState::Running);
        info!("stream connected");

        let (handoff_tx, handoff_rx) = bounded::<Event>(self.handoff_capacity);
        let (done_tx, done_rx) = bounded::<DecodeEnd>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let decoder = {
            let all_events = self.all_events.clone();
            let shutdown = shutdown_rx.clone();
            thread::Builder::new()
                .name("stream-decode".to_string())
                .spawn(move || decode_loop(body, handoff_tx, all_events, shutdown, done_tx))
        };
        let decoder = match decoder {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "failed to spawn decode thread");
                canceller.cancel();
                return StopReason::Failed(StreamError::Spawn("decode".to_string()));
            }
        };

        let fanout = {
            let subscriptions = Arc::clone(&self.subscriptions);
            let shutdown = shutdown_rx;
            thread::Builder::new()
                .name("stream-fanout".to_string())
                .spawn(move || fanout_loop(&subscriptions, handoff_rx, shutdown))
        };
        let fanout = match fanout {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "failed to spawn fan-out thread");
                None
            }
        };

        let reason = match fanout {
            None => StopReason::Failed(StreamError::Spawn("fan-out".to_string())),
            Some(_) => select! {
                recv(done_rx) -> end => match end {
                    Ok(DecodeEnd::Failed(e)) => StopReason::Failed(e),
                    Ok(DecodeEnd::Closed) | Ok(DecodeEnd::Shutdown) => StopReason::ConnectionClosed,
                    Err(_) => StopReason::Failed(StreamError::Decode(
                        "decode thread exited unexpectedly".to_string(),
                    )),
                },
                recv(stop) -> _ => StopReason::Requested,
            },
        };

        report(PumpState::Stopping);
        debug!(reason = %reason, "stream stopping");

        // On a requested stop the workers abandon pending handoffs; otherwise
        // the fan-out thread drains what was already decoded.
        let mut shutdown = Some(shutdown_tx);
        if matches!(reason, StopReason::Requested) || fanout.is_none() {
            shutdown.take();
        }
        canceller.cancel();

        if decoder.join().is_err() {
            error!("decode thread panicked");
        }
        if let Some(fanout) = fanout {
            if fanout.join().is_err() {
                error!("fan-out thread panicked");
            }
        }
        drop(shutdown);
        drop(canceller);

        reason
    }
}

fn is_shut_down(shutdown: &Receiver<()>) -> bool {
    matches!(shutdown.try_recv(), Err(TryRecvError::Disconnected))
}

/// Send unless the pump is shutting down. Returns false if the event was not handed over.
fn forward(tx: &Sender<Event>, event: Event, shutdown: &Receiver<()>) -> bool {
    select! {
        send(tx, event) -> res => res.is_ok(),
        recv(shutdown) -> _ => false,
    }
}

fn decode_loop(
    body: Box<dyn Read + Send>,
    handoff: Sender<Event>,
    all_events: Option<Sender<Event>>,
    shutdown: Receiver<()>,
    done: Sender<DecodeEnd>,
) {
    let mut records =
        serde_json::Deserializer::from_reader(BufReader::new(body)).into_iter::<StreamRecord>();
    let mut decoded = 0u64;

    let end = loop {
        let record = match records.next() {
            None => break DecodeEnd::Closed,
            Some(Ok(record)) => record,
            Some(Err(_)) if is_shut_down(&shutdown) => break DecodeEnd::Shutdown,
            Some(Err(e)) if e.is_io() => {
                break DecodeEnd::Failed(StreamError::Transport(e.to_string()))
            }
            Some(Err(e)) => break DecodeEnd::Failed(StreamError::Decode(e.to_string())),
        };

        if record.data.is_none() {
            warn!(errors = ?record.errors, "stream notice without data");
            continue;
        }
        let Some(event) = record.into_event() else {
            continue;
        };
        decoded += 1;

        if let Some(all_events) = &all_events {
            if !forward(all_events, event.clone(), &shutdown) {
                break DecodeEnd::Shutdown;
            }
        }
        if !forward(&handoff, event, &shutdown) {
            break DecodeEnd::Shutdown;
        }
    };

    // Releases the connection.
    drop(records);

    match &end {
        DecodeEnd::Failed(e) => error!(error = %e, decoded, "stream decoding failed"),
        DecodeEnd::Closed => info!(decoded, "stream closed by server"),
        DecodeEnd::Shutdown => debug!(decoded, "decode loop shut down"),
    }
    let _ = done.send(end);
}

fn fanout_loop(
    subscriptions: &SubscriptionManager,
    handoff: Receiver<Event>,
    shutdown: Receiver<()>,
) {
    loop {
        select! {
            recv(handoff) -> event => match event {
                Ok(event) => {
                    subscriptions.deliver(&event);
                }
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
}
