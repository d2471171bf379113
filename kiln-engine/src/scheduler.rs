//! Event-driven build scheduler.
//!
//! The scheduler owns the build graph and is the only thread that mutates
//! it. Parallelism comes entirely from worker subprocesses; the scheduler
//! has exactly one suspension point, a select over worker events and the
//! slow-start ticker. Every state change is published to the status bus
//! before the loop suspends again.

use std::cmp;
use std::collections::{BTreeMap, HashSet};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{after, select, tick, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use signal_hook::iterator::Signals;

use kiln_core::{BuildPhase, PortId};

use crate::config::Config;
use crate::error::EngineError;
use crate::graph::{BuildGraph, FailureReason, NodeId, PortState, Tally};
use crate::ipc::{BuildTask, TaskOutcome, TaskResult, WorkerRequest};
use crate::repo::Repository;
use crate::slot::{SlotState, WorkerLauncher, WorkerSlot};
use crate::status::{StatusBus, StatusEvent};

/// Events that wake the scheduler loop.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// A worker entered a new build phase.
    Phase {
        slot_id: u32,
        port: PortId,
        phase: BuildPhase,
    },
    /// A worker finished its task.
    TaskDone { slot_id: u32, result: TaskResult },
    /// A worker process exited.
    SlotExited { slot_id: u32, code: Option<i32> },
    /// The operator asked for a graceful stop.
    Interrupted,
}

/// Tuning knobs that vary between directives and tests.
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    /// Initial effective parallelism; ramps up to the configured builder
    /// count one step at a time.
    pub slow_start: u32,
    pub slow_start_step: Duration,
    /// How long cancelled workers get before their process groups are
    /// signalled.
    pub grace_period: Duration,
    /// Environment overrides forwarded to every build task.
    pub build_env: BTreeMap<String, String>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            slow_start: 1,
            slow_start_step: Duration::from_secs(30),
            grace_period: Duration::from_secs(30),
            build_env: BTreeMap::new(),
        }
    }
}

/// Final report of one run.
#[derive(Clone, Debug)]
pub struct BuildSummary {
    pub tally: Tally,
    pub failed_ports: Vec<(PortId, String)>,
    pub interrupted: bool,
}

impl BuildSummary {
    /// Process exit code: the failed-port count clamped to 255, or 1 for an
    /// interrupted run with no failures.
    pub fn exit_code(&self) -> i32 {
        if self.tally.failed > 0 {
            cmp::min(self.tally.failed, 255) as i32
        } else if self.interrupted {
            1
        } else {
            0
        }
    }
}

/// Installs SIGINT/SIGTERM forwarding into the scheduler's event channel.
pub fn watch_signals(events: Sender<SchedulerEvent>) -> Result<(), EngineError> {
    let signals = Signals::new(&[signal_hook::SIGINT, signal_hook::SIGTERM])
        .map_err(|err| EngineError::Ipc(format!("unable to install signal handler: {}", err)))?;

    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || {
            for _signal in signals.forever() {
                if events.send(SchedulerEvent::Interrupted).is_err() {
                    break;
                }
            }
        })
        .map_err(|err| EngineError::Ipc(format!("unable to spawn signal watcher: {}", err)))?;

    Ok(())
}

#[derive(Debug)]
pub struct Scheduler<'a> {
    graph: BuildGraph,
    config: &'a Config,
    repo: Repository,
    launcher: Box<dyn WorkerLauncher>,
    bus: StatusBus,
    options: SchedulerOptions,
    events_tx: Sender<SchedulerEvent>,
    events_rx: Receiver<SchedulerEvent>,
    slots: Vec<WorkerSlot>,
    running: usize,
    /// Nodes already retried after a worker abort.
    retried: HashSet<NodeId>,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        graph: BuildGraph,
        config: &'a Config,
        repo: Repository,
        launcher: Box<dyn WorkerLauncher>,
        bus: StatusBus,
        options: SchedulerOptions,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        Scheduler {
            graph,
            config,
            repo,
            launcher,
            bus,
            options,
            events_tx,
            events_rx,
            slots: Vec::new(),
            running: 0,
            retried: HashSet::new(),
        }
    }

    /// Channel for external event producers (the signal watcher).
    pub fn event_sender(&self) -> Sender<SchedulerEvent> {
        self.events_tx.clone()
    }

    /// Drives the graph to completion and returns the summary.
    pub fn run(mut self) -> Result<BuildSummary, EngineError> {
        self.publish_resolution_outcomes();

        // Nothing to do: exit without spawning a single worker.
        if self.graph.is_complete() {
            return Ok(self.summarize(false));
        }

        let slot_count = cmp::min(self.config.num_builders, self.graph.tally().remaining).max(1);
        for slot_id in 0..slot_count as u32 {
            let slot = self.spawn_slot(slot_id)?;
            self.slots.push(slot);
        }
        info!(
            "scheduling {} ports across {} worker slots",
            self.graph.tally().remaining,
            self.slots.len()
        );

        let ticker = tick(self.options.slow_start_step);
        let events_rx = self.events_rx.clone();
        let mut slow_limit = cmp::max(self.options.slow_start, 1) as usize;

        loop {
            self.dispatch(slow_limit);
            if self.graph.is_complete() && self.running == 0 {
                break;
            }

            select! {
                recv(events_rx) -> event => {
                    let event = event.map_err(|_| {
                        EngineError::Ipc("scheduler event channel closed".to_string())
                    })?;
                    if self.handle_event(event)? {
                        return self.cancel_and_summarize();
                    }
                }
                recv(ticker) -> _ => {
                    if slow_limit < self.config.num_builders {
                        slow_limit += 1;
                        debug!("slow-start: effective parallelism now {}", slow_limit);
                    }
                    let tally = self.graph.tally();
                    self.bus.publish_tick(tally.remaining, self.running);
                }
            }
        }

        self.shutdown_slots();
        Ok(self.summarize(false))
    }

    /// Reports ports that resolution already settled (ignored, skipped, or
    /// found prebuilt) so subscribers see the whole picture.
    fn publish_resolution_outcomes(&mut self) {
        let mut events = Vec::new();
        for (_, node) in self.graph.iter() {
            let reason = node
                .failure_reason()
                .map(|r| r.to_string())
                .unwrap_or_default();
            match node.state() {
                PortState::Ignored => events.push(StatusEvent::Ignored {
                    port: node.id().clone(),
                    reason,
                }),
                PortState::Skipped => events.push(StatusEvent::Skipped {
                    port: node.id().clone(),
                    reason,
                }),
                _ => {}
            }
        }
        for event in events {
            self.bus.publish(event);
        }
    }

    fn spawn_slot(&mut self, slot_id: u32) -> Result<WorkerSlot, EngineError> {
        let connection = self.launcher.launch(slot_id, self.events_tx.clone())?;
        Ok(WorkerSlot::new(slot_id, connection))
    }

    /// Hands ready nodes to idle slots, highest priority first, up to the
    /// current effective parallelism.
    fn dispatch(&mut self, slow_limit: usize) {
        let effective = cmp::min(self.config.num_builders, slow_limit);

        loop {
            if self.running >= effective {
                return;
            }
            let node = match self.graph.ready_nodes_ordered().first() {
                Some(&node) => node,
                None => return,
            };
            let slot_idx = match self
                .slots
                .iter()
                .position(|slot| slot.state == SlotState::Idle)
            {
                Some(idx) => idx,
                None => return,
            };

            self.graph.begin_staging(node);
            let task = self.build_task(node);
            let port = task.port.clone();

            let slot = &mut self.slots[slot_idx];
            slot.connection.send(WorkerRequest::Build(task));
            slot.state = SlotState::Assigned;
            slot.current = Some(node);
            self.running += 1;

            let slot_id = slot.slot_id;
            debug!("dispatched {} to slot {:02}", port, slot_id);
            self.bus.publish(StatusEvent::Started { port, slot_id });
        }
    }

    fn build_task(&self, node: NodeId) -> BuildTask {
        let entry = self.graph.node(node);
        let stage_packages = self
            .graph
            .staging_set(node)
            .into_iter()
            .map(|dep| self.repo.package_path(self.graph.node(dep).pkgname()))
            .collect();

        let mut env = self.options.build_env.clone();
        env.insert(
            "MAKE_JOBS_NUMBER".to_string(),
            self.config.max_jobs.to_string(),
        );

        let fingerprint = match entry.fingerprint() {
            Some(fp) => *fp,
            // Unreachable for a Ready node; recorded rather than trusted.
            None => kiln_core::Fingerprint::record().version(entry.version()).finish(),
        };

        BuildTask {
            port: entry.id().clone(),
            version: entry.version().to_string(),
            pkgname: entry.pkgname().to_string(),
            fingerprint,
            stage_packages,
            env,
            log_path: entry.log_path().clone(),
        }
    }

    /// Applies one event. Returns `Ok(true)` when the run must cancel.
    fn handle_event(&mut self, event: SchedulerEvent) -> Result<bool, EngineError> {
        match event {
            SchedulerEvent::Phase {
                slot_id,
                port,
                phase,
            } => {
                if let Some(node) = self.graph.node_id(&port) {
                    self.graph.note_phase(node, phase);
                }
                if let Some(slot) = self.slots.get_mut(slot_id as usize) {
                    if slot.state == SlotState::Assigned {
                        slot.state = SlotState::Running;
                    }
                }
                self.bus.publish(StatusEvent::PhaseChanged { port, phase });
            }
            SchedulerEvent::TaskDone { slot_id, result } => {
                let node = match self.slots.get_mut(slot_id as usize) {
                    Some(slot) if slot.current.is_some() => {
                        let node = slot.current.take();
                        slot.state = SlotState::Idle;
                        self.running -= 1;
                        node
                    }
                    _ => {
                        warn!("result from slot {:02} with no task", slot_id);
                        None
                    }
                };
                if let Some(node) = node {
                    self.apply_result(node, result)?;
                }
            }
            SchedulerEvent::SlotExited { slot_id, code } => {
                self.handle_slot_exit(slot_id, code)?;
            }
            SchedulerEvent::Interrupted => return Ok(true),
        }
        Ok(false)
    }

    fn apply_result(&mut self, node: NodeId, result: TaskResult) -> Result<(), EngineError> {
        let port = self.graph.node(node).id().clone();
        match result.outcome {
            TaskOutcome::Success { .. } => {
                let newly_ready = self.graph.mark_succeeded(node);
                debug!("{} succeeded, {} ports unblocked", port, newly_ready.len());
                self.bus.publish(StatusEvent::Succeeded {
                    port,
                    duration: result.duration,
                });
            }
            TaskOutcome::Failed { phase } => {
                self.fail_node(node, FailureReason::Phase(phase));
            }
            TaskOutcome::Cancelled => {
                self.fail_node(node, FailureReason::Cancelled);
            }
            TaskOutcome::Aborted { message } => {
                self.fail_node(node, FailureReason::Phase(BuildPhase::Package));
                self.bus.close();
                return Err(EngineError::Repository(format!(
                    "worker could not publish {}: {}",
                    port, message
                )));
            }
        }
        Ok(())
    }

    /// Marks a node failed, cascades skips, and publishes both.
    fn fail_node(&mut self, node: NodeId, reason: FailureReason) {
        let port = self.graph.node(node).id().clone();
        let skipped = self.graph.mark_failed(node, reason.clone());
        info!("{} failed: {}", port, reason);
        self.bus.publish(StatusEvent::Failed {
            port,
            reason: reason.to_string(),
        });
        for skip in skipped {
            let entry = self.graph.node(skip);
            self.bus.publish(StatusEvent::Skipped {
                port: entry.id().clone(),
                reason: entry
                    .failure_reason()
                    .map(|r| r.to_string())
                    .unwrap_or_default(),
            });
        }
    }

    /// A worker process died. Busy slots mean an aborted task: retry once
    /// on a fresh slot, fail the port on the second abort. The slot itself
    /// is always recreated.
    fn handle_slot_exit(&mut self, slot_id: u32, code: Option<i32>) -> Result<(), EngineError> {
        let (was_busy, node) = match self.slots.get_mut(slot_id as usize) {
            Some(slot) => {
                if slot.state == SlotState::Reaped {
                    return Ok(());
                }
                let was_busy = slot.is_busy();
                let node = slot.current.take();
                slot.state = SlotState::Reaped;
                (was_busy, node)
            }
            None => return Ok(()),
        };

        warn!(
            "worker slot {:02} exited unexpectedly (code {:?})",
            slot_id, code
        );

        if was_busy {
            self.running -= 1;
        }

        let connection = self.launcher.launch(slot_id, self.events_tx.clone())?;
        if let Some(slot) = self.slots.get_mut(slot_id as usize) {
            slot.connection = connection;
            slot.state = SlotState::Idle;
        }

        if let Some(node) = node {
            if self.retried.insert(node) {
                info!(
                    "retrying {} after worker abort",
                    self.graph.node(node).id()
                );
                self.graph.requeue(node);
            } else {
                self.fail_node(node, FailureReason::WorkerAborted);
            }
        }
        Ok(())
    }

    /// Graceful cancellation: stop dispatching, ask busy workers to stop,
    /// escalate to process-group signals after the grace period.
    fn cancel_and_summarize(mut self) -> Result<BuildSummary, EngineError> {
        info!("interrupted: cancelling {} active builds", self.running);

        for slot in &self.slots {
            if slot.is_busy() {
                slot.connection.send(WorkerRequest::Cancel);
            }
        }

        let deadline = after(self.options.grace_period);
        let events_rx = self.events_rx.clone();
        while self.running > 0 {
            select! {
                recv(events_rx) -> event => {
                    match event {
                        Ok(SchedulerEvent::TaskDone { slot_id, result }) => {
                            let node = match self.slots.get_mut(slot_id as usize) {
                                Some(slot) if slot.current.is_some() => {
                                    let node = slot.current.take();
                                    slot.state = SlotState::Idle;
                                    self.running -= 1;
                                    node
                                }
                                _ => None,
                            };
                            if let Some(node) = node {
                                // A task that finished before the cancel
                                // reached it still counts.
                                match result.outcome {
                                    TaskOutcome::Success { .. } => {
                                        self.graph.mark_succeeded(node);
                                        self.bus.publish(StatusEvent::Succeeded {
                                            port: self.graph.node(node).id().clone(),
                                            duration: result.duration,
                                        });
                                    }
                                    TaskOutcome::Failed { phase } => {
                                        self.fail_node(node, FailureReason::Phase(phase));
                                    }
                                    _ => self.fail_node(node, FailureReason::Cancelled),
                                }
                            }
                        }
                        Ok(SchedulerEvent::SlotExited { slot_id, .. }) => {
                            let node = match self.slots.get_mut(slot_id as usize) {
                                Some(slot) => {
                                    if slot.is_busy() {
                                        self.running -= 1;
                                    }
                                    slot.state = SlotState::Reaped;
                                    slot.current.take()
                                }
                                None => None,
                            };
                            if let Some(node) = node {
                                self.fail_node(node, FailureReason::Cancelled);
                            }
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
                recv(deadline) -> _ => {
                    warn!("grace period expired; signalling worker process groups");
                    for slot in &self.slots {
                        if slot.is_busy() {
                            slot.connection.signal(Signal::SIGTERM);
                        }
                    }
                    thread::sleep(Duration::from_secs(2));
                    let mut abandoned = Vec::new();
                    for slot in &mut self.slots {
                        if slot.is_busy() {
                            slot.connection.signal(Signal::SIGKILL);
                            if let Some(node) = slot.current.take() {
                                abandoned.push(node);
                            }
                            slot.state = SlotState::Reaped;
                            self.running -= 1;
                        }
                    }
                    for node in abandoned {
                        self.fail_node(node, FailureReason::Cancelled);
                    }
                    break;
                }
            }
        }

        for slot in &self.slots {
            if slot.state != SlotState::Reaped {
                slot.connection.send(WorkerRequest::Shutdown);
            }
        }

        Ok(self.summarize(true))
    }

    /// Asks every live worker to exit and waits for their teardown.
    fn shutdown_slots(&mut self) {
        for slot in &self.slots {
            if slot.state != SlotState::Reaped {
                slot.connection.send(WorkerRequest::Shutdown);
            }
        }

        let deadline = after(self.options.grace_period);
        let events_rx = self.events_rx.clone();
        loop {
            let live = self
                .slots
                .iter()
                .any(|slot| slot.state != SlotState::Reaped);
            if !live {
                break;
            }

            select! {
                recv(events_rx) -> event => {
                    match event {
                        Ok(SchedulerEvent::SlotExited { slot_id, .. }) => {
                            if let Some(slot) = self.slots.get_mut(slot_id as usize) {
                                slot.state = SlotState::Reaped;
                            }
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
                recv(deadline) -> _ => {
                    warn!("workers did not exit in time; abandoning them");
                    break;
                }
            }
        }
    }

    fn summarize(&mut self, interrupted: bool) -> BuildSummary {
        let tally = self.graph.tally();
        let failed_ports = self
            .graph
            .iter()
            .filter(|(_, node)| node.state() == PortState::Failed)
            .map(|(_, node)| {
                (
                    node.id().clone(),
                    node.failure_reason()
                        .map(|r| r.to_string())
                        .unwrap_or_default(),
                )
            })
            .collect();

        self.bus.publish_tick(tally.remaining, self.running);
        self.bus.close();

        BuildSummary {
            tally,
            failed_ports,
            interrupted,
        }
    }
}
