//! Plain-text renderer for status bus events.
//!
//! This is a pure subscriber: it owns no build state and can be replaced by
//! a richer display without touching the scheduler. Ticks redraw a one-line
//! tally; everything else is a line per event.

use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;

use kiln_engine::status::StatusEvent;

pub fn spawn_console(events: Receiver<StatusEvent>, verbose: bool) -> Console {
    let handle = thread::spawn(move || {
        for event in events {
            match event {
                StatusEvent::Started { port, slot_id } => {
                    println!("[{:02}] start   {}", slot_id, port);
                }
                StatusEvent::PhaseChanged { port, phase } => {
                    if verbose {
                        println!("     phase   {} {}", port, phase);
                    }
                }
                StatusEvent::Succeeded { port, duration } => {
                    println!("     built   {} ({}s)", port, duration.as_secs());
                }
                StatusEvent::Failed { port, reason } => {
                    println!("     FAILED  {} ({})", port, reason);
                }
                StatusEvent::Skipped { port, reason } => {
                    println!("     skipped {} ({})", port, reason);
                }
                StatusEvent::Ignored { port, reason } => {
                    println!("     ignored {} ({})", port, reason);
                }
                StatusEvent::Tick(snapshot) => {
                    println!(
                        "---- built {} failed {} skipped {} ignored {} remaining {} active {}",
                        snapshot.built,
                        snapshot.failed,
                        snapshot.skipped,
                        snapshot.ignored,
                        snapshot.remaining,
                        snapshot.active_slots
                    );
                }
            }
        }
    });

    Console { handle }
}

#[derive(Debug)]
pub struct Console {
    handle: JoinHandle<()>,
}

impl Console {
    /// Waits for the drain thread once the bus has closed.
    pub fn join(self) {
        let _ = self.handle.join();
    }
}
