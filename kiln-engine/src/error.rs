use std::io;
use std::path::PathBuf;

use failure::Fail;

/// Fatal errors surfaced by the engine.
///
/// Per-port problems (metadata extraction, build failures) are not errors at
/// this level; they are recorded in the build graph and reported through the
/// status bus. An `EngineError` terminates the run.
#[derive(Debug, Fail)]
pub enum EngineError {
    #[fail(display = "configuration error: {}", _0)]
    Config(String),

    #[fail(display = "{}: {}", path, err)]
    Io {
        path: String,
        #[fail(cause)]
        err: io::Error,
    },

    #[fail(display = "worker channel error: {}", _0)]
    Ipc(String),

    #[fail(display = "sandbox error: {}", _0)]
    Sandbox(String),

    #[fail(display = "repository error: {}", _0)]
    Repository(String),
}

impl EngineError {
    pub fn io(path: &PathBuf, err: io::Error) -> Self {
        EngineError::Io {
            path: path.display().to_string(),
            err,
        }
    }
}
