// Delay-compensated digital pulse dispatcher
//
// Requests arrive from the acquisition thread together with the instant the
// crossing was detected. Each pulse waits only for the part of the trigger
// delay that has not already elapsed, then opens its line and writes a
// true/false edge pair on the blocking pool. Failures drop the pulse and are
// reported; they never reach the acquisition loop.

use crate::device::DaqDevice;
use crate::types::{StimulationCommand, Stimulator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Time left to wait once `elapsed` of `delay` has already passed; never negative
pub fn remaining_delay(delay: Duration, elapsed: Duration) -> Duration {
    delay.saturating_sub(elapsed)
}

/// A command plus the wall-clock instant its crossing was detected
#[derive(Debug, Clone)]
pub struct PulseRequest {
    pub command: StimulationCommand,
    pub detected_at: Instant,
}

/// What happened to one pulse request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PulseOutcome {
    Fired {
        stimulator: Stimulator,
        line: String,
        /// Time between detection and the rising edge
        latency_ms: f64,
    },
    Dropped {
        stimulator: Stimulator,
        line: String,
        reason: String,
    },
    Cancelled {
        stimulator: Stimulator,
        line: String,
    },
}

type OutcomeCallback = Arc<dyn Fn(PulseOutcome) + Send + Sync>;

/// Sending half handed to the acquisition thread
#[derive(Clone)]
pub struct PulseSender {
    tx: mpsc::UnboundedSender<PulseRequest>,
}

impl PulseSender {
    /// Queue a pulse; returns false once the dispatcher has shut down
    pub fn submit(&self, command: StimulationCommand, detected_at: Instant) -> bool {
        self.tx
            .send(PulseRequest {
                command,
                detected_at,
            })
            .is_ok()
    }
}

pub struct PulseDispatcher {
    sender: PulseSender,
    task: JoinHandle<()>,
}

impl PulseDispatcher {
    pub fn spawn<F>(
        handle: &Handle,
        device: Arc<dyn DaqDevice>,
        cancel: CancellationToken,
        on_outcome: F,
    ) -> Self
    where
        F: Fn(PulseOutcome) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_outcome: OutcomeCallback = Arc::new(on_outcome);
        let task = handle.spawn(dispatch_loop(rx, device, cancel, on_outcome));
        Self {
            sender: PulseSender { tx },
            task,
        }
    }

    pub fn sender(&self) -> PulseSender {
        self.sender.clone()
    }

    pub fn submit(&self, command: StimulationCommand, detected_at: Instant) -> bool {
        self.sender.submit(command, detected_at)
    }

    /// Wait for every queued and in-flight pulse to finish or observe cancellation
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.task.await {
            log::error!("Pulse dispatcher task failed: {}", e);
        }
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<PulseRequest>,
    device: Arc<dyn DaqDevice>,
    cancel: CancellationToken,
    on_outcome: OutcomeCallback,
) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::debug!("Pulse dispatcher cancelled");
                break;
            }

            request = rx.recv() => match request {
                Some(request) => {
                    in_flight.spawn(fire_pulse(
                        request,
                        Arc::clone(&device),
                        cancel.clone(),
                        Arc::clone(&on_outcome),
                    ));
                }
                None => break,
            },

            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    // Requests still queued when cancelled never reach the hardware
    rx.close();
    while let Ok(request) = rx.try_recv() {
        on_outcome(PulseOutcome::Cancelled {
            stimulator: request.command.stimulator,
            line: request.command.line,
        });
    }

    while in_flight.join_next().await.is_some() {}
    log::debug!("Pulse dispatcher stopped");
}

async fn fire_pulse(
    request: PulseRequest,
    device: Arc<dyn DaqDevice>,
    cancel: CancellationToken,
    on_outcome: OutcomeCallback,
) {
    let PulseRequest {
        command,
        detected_at,
    } = request;
    let delay = Duration::from_secs_f64(command.delay_secs.max(0.0));
    let wait = remaining_delay(delay, detected_at.elapsed());

    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            on_outcome(PulseOutcome::Cancelled {
                stimulator: command.stimulator,
                line: command.line,
            });
            return;
        }

        _ = tokio::time::sleep(wait) => {}
    }

    let line = command.line.clone();
    let written = tokio::task::spawn_blocking(move || {
        let mut output = device.open_digital(&line)?;
        output.write(true)?;
        let rising_edge = Instant::now();
        output.write(false)?;
        Ok::<Instant, crate::device::DeviceError>(rising_edge)
    })
    .await;

    let outcome = match written {
        Ok(Ok(rising_edge)) => PulseOutcome::Fired {
            stimulator: command.stimulator,
            line: command.line,
            latency_ms: rising_edge.duration_since(detected_at).as_secs_f64() * 1000.0,
        },
        Ok(Err(e)) => PulseOutcome::Dropped {
            stimulator: command.stimulator,
            line: command.line,
            reason: e.to_string(),
        },
        Err(e) => PulseOutcome::Dropped {
            stimulator: command.stimulator,
            line: command.line,
            reason: format!("pulse task failed: {}", e),
        },
    };
    on_outcome(outcome);
}
