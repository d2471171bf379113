//! Scheduler-side worker slot handling.
//!
//! Each slot is a child process reached over its stdin/stdout pipes. A
//! writer thread owns the child's stdin and a reader thread owns its
//! stdout; everything the child says is converted into scheduler events, so
//! the scheduler itself never blocks on a pipe.

use std::fmt::Debug;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::EngineError;
use crate::graph::NodeId;
use crate::ipc::{self, WorkerReply, WorkerRequest};
use crate::scheduler::SchedulerEvent;

/// Lifecycle of one worker slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotState {
    /// Alive with no task outstanding.
    Idle,
    /// A task was sent and the worker has not yet reported a phase.
    Assigned,
    /// The worker reported progress on its task.
    Running,
    /// The process is gone and must not be handed further work.
    Reaped,
}

/// Channel to a live worker process.
pub struct SlotConnection {
    requests: Sender<WorkerRequest>,
    /// Process group to signal for forceful termination; `None` for
    /// in-process test workers.
    pgid: Option<i32>,
}

impl Debug for SlotConnection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(SlotConnection))
            .field("pgid", &self.pgid)
            .finish()
    }
}

impl SlotConnection {
    pub fn new(requests: Sender<WorkerRequest>, pgid: Option<i32>) -> Self {
        SlotConnection { requests, pgid }
    }

    /// Queues a request for the writer thread. Errors mean the worker died;
    /// the reader thread reports that separately.
    pub fn send(&self, request: WorkerRequest) {
        if self.requests.send(request).is_err() {
            debug!("worker channel already closed");
        }
    }

    /// Signals the worker's whole process group.
    pub fn signal(&self, signal: Signal) {
        if let Some(pgid) = self.pgid {
            // Negative pid addresses the process group.
            if let Err(err) = kill(Pid::from_raw(-pgid), signal) {
                warn!("unable to signal worker group {}: {}", pgid, err);
            }
        }
    }
}

/// One slot as tracked by the scheduler.
#[derive(Debug)]
pub struct WorkerSlot {
    pub slot_id: u32,
    pub state: SlotState,
    pub current: Option<NodeId>,
    pub connection: SlotConnection,
}

impl WorkerSlot {
    pub fn new(slot_id: u32, connection: SlotConnection) -> Self {
        WorkerSlot {
            slot_id,
            state: SlotState::Idle,
            current: None,
            connection,
        }
    }

    pub fn is_busy(&self) -> bool {
        match self.state {
            SlotState::Assigned | SlotState::Running => true,
            SlotState::Idle | SlotState::Reaped => false,
        }
    }
}

/// Factory for worker slots, injected into the scheduler.
///
/// Production launches `kiln WORKER <slot-id>` subprocesses; tests install
/// scripted in-process workers.
pub trait WorkerLauncher: Debug {
    fn launch(
        &self,
        slot_id: u32,
        events: Sender<SchedulerEvent>,
    ) -> Result<SlotConnection, EngineError>;
}

/// Launcher that re-invokes this executable in `WORKER` mode.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    exec_path: PathBuf,
    config_path: PathBuf,
    profile: String,
}

impl ProcessLauncher {
    pub fn new(exec_path: PathBuf, config_path: PathBuf, profile: String) -> Self {
        ProcessLauncher {
            exec_path,
            config_path,
            profile,
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        slot_id: u32,
        events: Sender<SchedulerEvent>,
    ) -> Result<SlotConnection, EngineError> {
        let mut child = Command::new(&self.exec_path)
            .arg("WORKER")
            .arg(slot_id.to_string())
            .arg(&self.config_path)
            .arg(&self.profile)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|err| {
                EngineError::Ipc(format!(
                    "unable to spawn worker slot {:02}: {}",
                    slot_id, err
                ))
            })?;

        let pid = child.id() as i32;
        debug!("spawned worker slot {:02} as pid {}", slot_id, pid);

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Ipc("worker stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Ipc("worker stdout was not captured".to_string()))?;

        let (tx, rx) = unbounded::<WorkerRequest>();
        thread::Builder::new()
            .name(format!("slot{:02}-writer", slot_id))
            .spawn(move || {
                for request in rx {
                    if let Err(err) = ipc::write_frame(&mut stdin, &request) {
                        debug!("worker slot {:02} stdin closed: {}", slot_id, err);
                        break;
                    }
                }
            })
            .map_err(|err| EngineError::Ipc(format!("unable to spawn writer thread: {}", err)))?;

        thread::Builder::new()
            .name(format!("slot{:02}-reader", slot_id))
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                loop {
                    match ipc::read_frame::<_, WorkerReply>(&mut reader) {
                        Ok(Some(WorkerReply::Phase { port, phase })) => {
                            let _ = events.send(SchedulerEvent::Phase {
                                slot_id,
                                port,
                                phase,
                            });
                        }
                        Ok(Some(WorkerReply::Done(result))) => {
                            let _ = events.send(SchedulerEvent::TaskDone { slot_id, result });
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!("worker slot {:02} protocol error: {}", slot_id, err);
                            break;
                        }
                    }
                }
                let code = child.wait().ok().and_then(|status| status.code());
                let _ = events.send(SchedulerEvent::SlotExited { slot_id, code });
            })
            .map_err(|err| EngineError::Ipc(format!("unable to spawn reader thread: {}", err)))?;

        Ok(SlotConnection::new(tx, Some(pid)))
    }
}
