//! Error types for the executor, the harness and configuration loading.

use std::fmt;
use std::io;

/// Failures at the isolated-execution boundary.
///
/// None of these are fatal to the harness; each one sends it into degraded
/// mode.
#[derive(Debug)]
pub enum ExecutorError {
    /// The environment cannot host an isolated context.
    Unavailable(String),
    /// The worker thread could not be created.
    Spawn(io::Error),
    /// The worker is gone and no longer accepts requests.
    Disconnected,
    /// A frame could not be encoded or decoded.
    Protocol(serde_json::Error),
    /// The worker reported a failure.
    Worker(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(reason) => write!(f, "isolation unavailable: {reason}"),
            Self::Spawn(e) => write!(f, "failed to spawn executor thread: {e}"),
            Self::Disconnected => write!(f, "executor disconnected"),
            Self::Protocol(e) => write!(f, "malformed executor frame: {e}"),
            Self::Worker(message) => write!(f, "executor worker error: {message}"),
        }
    }
}

impl std::error::Error for ExecutorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(e) => Some(e),
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

/// Configuration could not be loaded or is invalid.
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "cannot read config: {e}"),
            Self::Parse(e) => write!(f, "cannot parse config: {e}"),
            Self::Invalid(reason) => write!(f, "invalid config: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}

/// Errors surfaced by the [`Harness`](crate::Harness) handle.
#[derive(Debug)]
pub enum HarnessError {
    /// The control thread could not be created.
    Spawn(io::Error),
    /// The control thread has exited.
    ControlUnavailable,
    /// The request was abandoned because the harness stopped.
    Cancelled,
    Config(ConfigError),
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to spawn harness control thread: {e}"),
            Self::ControlUnavailable => write!(f, "harness control thread is not running"),
            Self::Cancelled => write!(f, "request cancelled by harness stop"),
            Self::Config(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for HarnessError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
