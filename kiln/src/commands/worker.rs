//! The `WORKER` directive: run as a slot child of the scheduler.

use std::path::Path;

use failure::Error;
use log::error;

use kiln_engine::config::Config;
use kiln_engine::worker::run_worker;

/// Loads the same profile as the parent and enters the worker loop.
///
/// A non-zero exit tells the scheduler the slot is gone; it respawns a
/// fresh one with a clean mount table.
pub fn run(slot_id: u32, config_path: &Path, profile: &str) -> Result<i32, Error> {
    let config = Config::load(config_path, Some(profile))?;

    match run_worker(slot_id, &config) {
        Ok(()) => Ok(0),
        Err(err) => {
            error!("worker slot {:02} retiring: {}", slot_id, err);
            Ok(1)
        }
    }
}
