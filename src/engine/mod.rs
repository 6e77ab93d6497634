//! The seam between the bootstrap sequence and the database engine.
//!
//! - `shell.rs`: argument building and execution for the `mongo` client
//! - `mongod.rs`: the real engine, spawned as a child process

pub mod mongod;
pub mod shell;

pub use mongod::{Mongod, MongodProcess};
pub use shell::MongoShell;

use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use crate::error::EntrypointError;

/// Which of the two startups an engine instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Localhost only, no auth; lives just long enough to provision users.
    Temporary,
    /// Networked with auth; runs until the container stops.
    Final,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Temporary => "bootstrap",
            Self::Final => "run",
        }
    }
}

#[async_trait]
pub trait Engine: Send + Sync {
    type Process: EngineProcess;

    async fn launch(&self, phase: Phase) -> Result<Self::Process, EntrypointError>;

    /// One readiness probe against the local instance.
    async fn probe(&self) -> Result<(), EntrypointError>;

    /// Evaluate `script` against `database` on the local, unauthenticated instance.
    async fn eval(&self, database: &str, script: &str) -> Result<String, EntrypointError>;

    /// Resolve once a stopped instance no longer holds the data directory.
    async fn await_release(&self) -> Result<(), EntrypointError>;
}

#[async_trait]
pub trait EngineProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// `Some` once the process has exited.
    fn exit_status(&self) -> Option<ExitStatus>;

    /// Most recent output lines, oldest first.
    fn diagnostics(&self) -> Vec<String>;

    async fn wait(&self) -> Result<ExitStatus, EntrypointError>;

    /// Ask the process to stop with SIGTERM and wait up to `timeout` for it.
    async fn terminate(&self, timeout: Duration) -> Result<ExitStatus, EntrypointError>;
}

/// Container exit code for an engine exit status.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
