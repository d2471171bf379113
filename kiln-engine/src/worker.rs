//! Worker slot process entry point.
//!
//! A worker is this executable re-invoked in `WORKER` mode, which gives
//! every build a pristine address space. It reads length-prefixed tasks
//! from stdin, drives the sandbox through the build phases, and writes
//! results to stdout. Cancellation is honored at phase boundaries.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::unbounded;
use log::{debug, info, warn};
use nix::unistd::setsid;

use kiln_core::BuildPhase;

use crate::config::Config;
use crate::error::EngineError;
use crate::ipc::{self, BuildTask, TaskOutcome, TaskResult, WorkerReply, WorkerRequest};
use crate::repo::Repository;
use crate::sandbox::{log_phase_banner, open_build_log, Sandbox};

/// Runs the worker loop until shutdown. A returned error means the slot
/// must retire; the scheduler will respawn it.
pub fn run_worker(slot_id: u32, config: &Config) -> Result<(), EngineError> {
    // Become a process-group leader so the scheduler can signal this worker
    // and all of its phase children at once.
    if let Err(err) = setsid() {
        debug!("setsid failed (already a group leader?): {}", err);
    }

    let repo = Repository::open(&config.dir_repository)?;
    let mut sandbox = Sandbox::new(config, slot_id);
    sandbox.prepare()?;
    info!("worker slot {:02} ready", slot_id);

    // The reader thread owns stdin. Cancels flip the flag immediately;
    // tasks and shutdowns queue behind the one in progress.
    let cancel = Arc::new(AtomicBool::new(false));
    let (requests_tx, requests_rx) = unbounded::<WorkerRequest>();
    {
        let cancel = cancel.clone();
        thread::Builder::new()
            .name("stdin-reader".to_string())
            .spawn(move || {
                let stdin = io::stdin();
                let mut stdin = stdin.lock();
                loop {
                    match ipc::read_frame::<_, WorkerRequest>(&mut stdin) {
                        Ok(Some(WorkerRequest::Cancel)) => {
                            cancel.store(true, Ordering::SeqCst);
                        }
                        Ok(Some(request)) => {
                            if requests_tx.send(request).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!("worker stdin decode error: {}", err);
                            break;
                        }
                    }
                }
            })
            .map_err(|err| EngineError::Ipc(format!("unable to spawn stdin reader: {}", err)))?;
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();

    for request in requests_rx {
        match request {
            WorkerRequest::Build(task) => {
                cancel.store(false, Ordering::SeqCst);
                let result = execute_task(&mut sandbox, &repo, &task, &cancel, &mut out)?;
                ipc::write_frame(&mut out, &WorkerReply::Done(result))
                    .map_err(|err| EngineError::Ipc(err.to_string()))?;
            }
            WorkerRequest::Cancel => {}
            WorkerRequest::Shutdown => break,
        }
    }

    sandbox.teardown()?;
    info!("worker slot {:02} shut down", slot_id);
    Ok(())
}

/// Drives one task through staging, the phase sequence, and capture.
///
/// Build problems become a `TaskResult`; only sandbox plumbing failures
/// bubble out as errors and retire the slot.
fn execute_task<W: Write>(
    sandbox: &mut Sandbox,
    repo: &Repository,
    task: &BuildTask,
    cancel: &AtomicBool,
    out: &mut W,
) -> Result<TaskResult, EngineError> {
    let started = Instant::now();

    let mut log = match open_build_log(&task.log_path) {
        Ok(log) => log,
        Err(err) => {
            // Cannot even write the log: the run has to stop.
            return Ok(finish(
                task,
                started,
                0,
                TaskOutcome::Aborted {
                    message: format!("unable to open {}: {}", task.log_path.display(), err),
                },
            ));
        }
    };

    sandbox.reset()?;
    sandbox.write_build_profile(task)?;

    if !sandbox.stage_packages(task, &log)? {
        let bytes = log_size(&log);
        return Ok(finish(
            task,
            started,
            bytes,
            TaskOutcome::Failed {
                phase: BuildPhase::PkgDepends,
            },
        ));
    }

    for &phase in BuildPhase::SEQUENCE.iter() {
        if cancel.load(Ordering::SeqCst) {
            info!("task {} cancelled before {}", task.port, phase);
            let bytes = log_size(&log);
            return Ok(finish(task, started, bytes, TaskOutcome::Cancelled));
        }

        let notify = WorkerReply::Phase {
            port: task.port.clone(),
            phase,
        };
        ipc::write_frame(out, &notify).map_err(|err| EngineError::Ipc(err.to_string()))?;

        if let Err(err) = log_phase_banner(&mut log, phase) {
            return Ok(finish(
                task,
                started,
                log_size(&log),
                TaskOutcome::Aborted {
                    message: format!("unable to append to build log: {}", err),
                },
            ));
        }

        let status = sandbox.run_phase(task, phase, &log)?;
        if !status.success() {
            info!("task {} failed in {}", task.port, phase);
            let bytes = log_size(&log);
            return Ok(finish(task, started, bytes, TaskOutcome::Failed { phase }));
        }
    }

    let outcome = match sandbox.capture_package(task, repo) {
        Ok(pkg_path) => TaskOutcome::Success { pkg_path },
        Err(err) => TaskOutcome::Aborted {
            message: err.to_string(),
        },
    };

    let bytes = log_size(&log);
    Ok(finish(task, started, bytes, outcome))
}

fn log_size(log: &std::fs::File) -> u64 {
    log.metadata().map(|meta| meta.len()).unwrap_or(0)
}

fn finish(task: &BuildTask, started: Instant, log_bytes: u64, outcome: TaskOutcome) -> TaskResult {
    TaskResult {
        port: task.port.clone(),
        outcome,
        duration: started.elapsed(),
        log_bytes,
    }
}
