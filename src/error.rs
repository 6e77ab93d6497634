use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error as ThisError;

use crate::types::state::BootState;

#[derive(Debug, ThisError)]
pub enum EntrypointError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<&'static str>),

    #[error("{name} must be 'true' or 'false', got {value:?}")]
    InvalidFlag { name: &'static str, value: String },

    #[error("invalid {name} {value:?}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    #[error("data directory {} is unusable: {reason}", .path.display())]
    DataDir { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {output}")]
    ShellFailed {
        program: String,
        status: ExitStatus,
        output: String,
    },

    #[error("engine not reachable yet: {0}")]
    Unreachable(String),

    #[error("engine did not become ready after {attempts} attempts: {last}")]
    NotReady { attempts: usize, last: String },

    #[error("engine exited during {phase} with {status}")]
    EngineExited {
        phase: &'static str,
        status: ExitStatus,
    },

    #[error("engine did not shut down within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("data directory lock {} still held after shutdown", .0.display())]
    LockHeld(PathBuf),

    #[error("failed to provision {target}: {reason}")]
    Provisioning { target: String, reason: String },

    #[error("bootstrap incomplete: created {created:?} but {failed} failed: {reason}")]
    ProvisioningIncomplete {
        created: Vec<String>,
        failed: String,
        reason: String,
    },

    #[error("illegal boot state transition {from} -> {to}")]
    InvalidTransition { from: BootState, to: BootState },

    #[error("interrupted by {0} before the engine was running")]
    Interrupted(&'static str),

    #[error("signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("harness error: {0}")]
    Harness(String),
}

/// Coarse classification of failures, mirrored in the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Readiness,
    Provisioning,
    External,
}

impl EntrypointError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingEnv(_)
            | Self::InvalidFlag { .. }
            | Self::InvalidValue { .. }
            | Self::Settings(_)
            | Self::DataDir { .. } => ErrorKind::Configuration,
            Self::Unreachable(_) | Self::NotReady { .. } => ErrorKind::Readiness,
            Self::Provisioning { .. } | Self::ProvisioningIncomplete { .. } => {
                ErrorKind::Provisioning
            }
            Self::Io(_)
            | Self::Spawn { .. }
            | Self::ShellFailed { .. }
            | Self::EngineExited { .. }
            | Self::ShutdownTimeout(_)
            | Self::LockHeld(_)
            | Self::InvalidTransition { .. }
            | Self::Interrupted(_)
            | Self::Signal(_)
            | Self::Json(_)
            | Self::Harness(_) => ErrorKind::External,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Configuration => 2,
            ErrorKind::Readiness => 3,
            ErrorKind::Provisioning => 4,
            ErrorKind::External => 1,
        }
    }
}

impl From<figment::Error> for EntrypointError {
    fn from(e: figment::Error) -> Self {
        Self::Settings(Box::new(e))
    }
}

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for EntrypointError {
    /// An engine that is still coming up or a lock that is still being
    /// released may change on the next poll; an engine that already exited
    /// never recovers on its own.
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::LockHeld(_))
    }
}
