//! Starting and stopping the stream pump.

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

use super::pump::StreamPump;

/// Start/stop hooks the subscription manager drives.
pub trait StreamLifecycle: Send + Sync {
    /// Start the stream unless it is already running.
    fn ensure_started(&self);

    /// Ask the running stream to stop. Never blocks; does nothing when idle.
    fn stop(&self);
}

/// Lifecycle of one pump instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpState {
    /// Not launched yet, or waiting for the previous instance to stop.
    NotStarted,
    Running,
    /// Tearing down the connection and worker threads.
    Stopping,
    Stopped,
}

struct RunState {
    running: bool,
    /// Incremented per launch; a pump only updates state for its own generation.
    generation: u64,
    state: PumpState,
    /// Dropping this is the stop signal.
    stop_tx: Option<Sender<()>>,
    last_pump: Option<JoinHandle<()>>,
}

/// Keeps at most one pump running and serializes start/stop requests.
pub struct StreamController {
    run: Arc<Mutex<RunState>>,
    pump: StreamPump,
}

impl StreamController {
    pub fn new(pump: StreamPump) -> Self {
        Self {
            run: Arc::new(Mutex::new(RunState {
                running: false,
                generation: 0,
                state: PumpState::NotStarted,
                stop_tx: None,
                last_pump: None,
            })),
            pump,
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().running
    }

    /// State of the most recently launched pump.
    pub fn state(&self) -> PumpState {
        self.run.lock().state
    }

    /// Number of pumps launched so far.
    pub fn generation(&self) -> u64 {
        self.run.lock().generation
    }

    /// Stop the stream and wait until the pump has fully stopped.
    ///
    /// Must not be called while holding the subscription lock: a pump that
    /// is still fanning out an event needs it to finish.
    pub fn shutdown(&self) {
        self.stop();
        let last = self.run.lock().last_pump.take();
        if let Some(handle) = last {
            if handle.join().is_err() {
                error!("stream pump panicked");
            }
        }
    }
}

impl StreamLifecycle for StreamController {
    fn ensure_started(&self) {
        let mut run = self.run.lock();
        if run.running {
            return;
        }

        let generation = run.generation + 1;
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let previous = run.last_pump.take();
        let pump = self.pump.clone();
        let shared = Arc::clone(&self.run);

        let spawned = thread::Builder::new()
            .name(format!("stream-pump-{}", generation))
            .spawn(move || {
                // The previous instance must reach Stopped before we connect.
                if let Some(previous) = previous {
                    if previous.join().is_err() {
                        error!("previous stream pump panicked");
                    }
                }

                let report = |state: PumpState| {
                    let mut run = shared.lock();
                    if run.generation != generation {
                        return;
                    }
                    run.state = state;
                    // Teardown may wait on a stalled subscriber; a subscribe in
                    // the meantime must launch the next generation.
                    if state == PumpState::Stopping {
                        run.running = false;
                        run.stop_tx = None;
                    }
                };
                let reason = pump.run(&stop_rx, &report);
                info!(generation, reason = %reason, "stop streaming");

                let mut run = shared.lock();
                if run.generation == generation {
                    run.running = false;
                    run.stop_tx = None;
                    run.state = PumpState::Stopped;
                }
            });

        match spawned {
            Ok(handle) => {
                run.generation = generation;
                run.running = true;
                run.state = PumpState::NotStarted;
                run.stop_tx = Some(stop_tx);
                run.last_pump = Some(handle);
                info!(generation, "starting stream");
            }
            Err(e) => error!(error = %e, "failed to spawn stream pump"),
        }
    }

    fn stop(&self) {
        let mut run = self.run.lock();
        if run.stop_tx.take().is_some() {
            info!(generation = run.generation, "stop requested");
        }
        run.running = false;
    }
}
