//! In-process publication of build events.
//!
//! The scheduler is the only publisher. Subscribers receive events over
//! bounded channels; a subscriber that stops draining loses events rather
//! than stalling the build. Events for a single port are published in state
//! machine order, so any subscriber sees them monotone.

use std::fmt::Write as FmtWrite;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::offset::Utc;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::warn;

use kiln_core::{BuildPhase, PortId};

use crate::error::EngineError;

/// Events dropped on a subscriber that has fallen this far behind.
const SUBSCRIBER_BUFFER: usize = 512;

#[derive(Clone, Debug)]
pub enum StatusEvent {
    Started { port: PortId, slot_id: u32 },
    PhaseChanged { port: PortId, phase: BuildPhase },
    Succeeded { port: PortId, duration: Duration },
    Failed { port: PortId, reason: String },
    Skipped { port: PortId, reason: String },
    Ignored { port: PortId, reason: String },
    Tick(Snapshot),
}

/// Point-in-time tally of the run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Snapshot {
    pub built: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ignored: usize,
    pub remaining: usize,
    pub active_slots: usize,
}

/// Broadcast channel from the scheduler to any number of subscribers.
#[derive(Debug)]
pub struct StatusBus {
    subscribers: Vec<Sender<StatusEvent>>,
    snapshot: Snapshot,
}

impl StatusBus {
    pub fn new() -> Self {
        StatusBus {
            subscribers: Vec::new(),
            snapshot: Snapshot::default(),
        }
    }

    /// Registers a new subscriber. Must be called before the run starts.
    pub fn subscribe(&mut self) -> Receiver<StatusEvent> {
        let (tx, rx) = bounded(SUBSCRIBER_BUFFER);
        self.subscribers.push(tx);
        rx
    }

    /// Publishes one event, updating the running tally.
    ///
    /// Never blocks: a full subscriber queue drops the event, a closed one
    /// unregisters the subscriber.
    pub fn publish(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::Succeeded { .. } => self.snapshot.built += 1,
            StatusEvent::Failed { .. } => self.snapshot.failed += 1,
            StatusEvent::Skipped { .. } => self.snapshot.skipped += 1,
            StatusEvent::Ignored { .. } => self.snapshot.ignored += 1,
            _ => {}
        }

        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Publishes a progress tick carrying the current tally.
    pub fn publish_tick(&mut self, remaining: usize, active_slots: usize) {
        self.snapshot.remaining = remaining;
        self.snapshot.active_slots = active_slots;
        let snapshot = self.snapshot;
        self.publish(StatusEvent::Tick(snapshot));
    }

    /// Current tally of the run.
    #[inline]
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    /// Drops all subscriber handles so their threads observe end of stream.
    pub fn close(&mut self) {
        self.subscribers.clear();
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        StatusBus::new()
    }
}

/// Renders one event as a `Summary.log` line. Ticks are not logged.
fn summary_line(event: &StatusEvent) -> Option<String> {
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
    let mut line = String::new();

    match *event {
        StatusEvent::Started { ref port, slot_id } => {
            let _ = write!(line, "[{}] start {} (slot {:02})", timestamp, port, slot_id);
        }
        StatusEvent::PhaseChanged { ref port, phase } => {
            let _ = write!(line, "[{}] phase {} {}", timestamp, port, phase);
        }
        StatusEvent::Succeeded { ref port, duration } => {
            let _ = write!(
                line,
                "[{}] success {} ({}s)",
                timestamp,
                port,
                duration.as_secs()
            );
        }
        StatusEvent::Failed {
            ref port,
            ref reason,
        } => {
            let _ = write!(line, "[{}] failure {}: {}", timestamp, port, reason);
        }
        StatusEvent::Skipped {
            ref port,
            ref reason,
        } => {
            let _ = write!(line, "[{}] skipped {}: {}", timestamp, port, reason);
        }
        StatusEvent::Ignored {
            ref port,
            ref reason,
        } => {
            let _ = write!(line, "[{}] ignored {}: {}", timestamp, port, reason);
        }
        StatusEvent::Tick(_) => return None,
    }

    Some(line)
}

/// Subscriber appending the event stream to `<logs>/Summary.log`.
#[derive(Debug)]
pub struct SummaryLog {
    handle: JoinHandle<()>,
}

impl SummaryLog {
    /// Opens the summary log for appending and spawns the drain thread.
    pub fn spawn(path: &Path, events: Receiver<StatusEvent>) -> Result<SummaryLog, EngineError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| EngineError::io(&path.to_path_buf(), err))?;

        let path = path.to_path_buf();
        let handle = thread::spawn(move || {
            for event in events {
                if let Some(line) = summary_line(&event) {
                    if writeln!(file, "{}", line).is_err() {
                        warn!("unable to append to {}", path.display());
                        break;
                    }
                }
            }
            let _ = file.flush();
        });

        Ok(SummaryLog { handle })
    }

    /// Waits for the drain thread after the bus has been closed.
    pub fn join(self) {
        let _ = self.handle.join();
    }
}
