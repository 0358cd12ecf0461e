//! Error types for keyboard-midi
//!
//! Recoverable conditions (enumeration, device open, stream I/O) are logged
//! and retried by their owners. `PortNameExhausted` and `Invariant` are fatal:
//! the binary runs the cooperative shutdown and exits non-zero.

use std::path::PathBuf;

use thiserror::Error;

use crate::audio::SinkError;

/// Library result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Device registry source could not be read or parsed
    #[error("failed to enumerate input devices from {path}: {source}")]
    Enumeration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Event stream could not be opened within the retry budget
    #[error("failed to open {path} after {attempts} attempts: {source}")]
    DeviceOpen {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Device stream read failed (usually: device unplugged)
    #[error("device stream error: {0}")]
    Io(#[from] std::io::Error),

    /// Every candidate port name from `name` to `name_127` is taken
    #[error("no free port name for \"{0}\" (tried \"{0}\" and \"{0}_0\"..\"{0}_127\")")]
    PortNameExhausted(String),

    /// Port sink rejected an operation
    #[error("port sink error: {0}")]
    Sink(#[from] SinkError),

    /// Key map file or directory is invalid
    #[error("invalid key map {path}: {message}")]
    Config { path: PathBuf, message: String },

    /// Internal bookkeeping disagrees with itself
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Whether the process must stop after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::PortNameExhausted(_) | Error::Invariant(_))
    }
}
