//! Length-prefixed message framing between the scheduler and worker slots.
//!
//! Each frame is a little-endian `u32` payload length followed by a JSON
//! payload. The framing is binary-safe and carries no delimiters, so log
//! fragments and environment values never confuse the channel.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use failure::Fail;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use kiln_core::{BuildPhase, Fingerprint, PortId};

/// Upper bound on a single frame, as a guard against a corrupted stream.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Scheduler-to-worker messages.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum WorkerRequest {
    /// Execute one build task.
    Build(BuildTask),
    /// Stop the current task at the next phase boundary.
    Cancel,
    /// Tear the sandbox down and exit cleanly.
    Shutdown,
}

/// Worker-to-scheduler messages.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum WorkerReply {
    /// The current task entered a new build phase.
    Phase { port: PortId, phase: BuildPhase },
    /// The current task reached a terminal outcome.
    Done(TaskResult),
}

/// One unit of work handed to a worker slot.
///
/// The task is an immutable snapshot; workers never see the build graph.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BuildTask {
    pub port: PortId,
    pub version: String,
    pub pkgname: String,
    pub fingerprint: Fingerprint,
    /// Pre-built dependency packages to install into the sandbox, in
    /// dependency order.
    pub stage_packages: Vec<PathBuf>,
    /// Environment overrides appended to the sandbox build profile.
    pub env: BTreeMap<String, String>,
    pub log_path: PathBuf,
}

/// Terminal report for one `BuildTask`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TaskResult {
    pub port: PortId,
    pub outcome: TaskOutcome,
    pub duration: Duration,
    pub log_bytes: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum TaskOutcome {
    /// All phases succeeded and the package was published.
    Success { pkg_path: PathBuf },
    /// A build phase exited non-zero.
    Failed { phase: BuildPhase },
    /// The task was cancelled at a phase boundary.
    Cancelled,
    /// The worker could not write the package or its log; the run must stop.
    Aborted { message: String },
}

#[derive(Debug, Fail)]
pub enum IpcError {
    #[fail(display = "worker channel I/O error: {}", _0)]
    Io(#[fail(cause)] io::Error),
    #[fail(display = "malformed worker message: {}", _0)]
    Codec(#[fail(cause)] serde_json::Error),
    #[fail(display = "worker frame of {} bytes exceeds the frame limit", _0)]
    Oversized(usize),
}

impl From<io::Error> for IpcError {
    fn from(err: io::Error) -> Self {
        IpcError::Io(err)
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        IpcError::Codec(err)
    }
}

/// Writes one message as a length-prefixed frame and flushes the stream.
pub fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), IpcError>
where
    W: Write,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(IpcError::Oversized(payload.len()));
    }

    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame, returning `None` on a clean end of stream.
pub fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, IpcError>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(IpcError::Oversized(len as usize));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(serde_json::from_slice(&payload)?))
}
