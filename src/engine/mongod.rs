use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::shell::MongoShell;
use super::{Engine, EngineProcess, Phase};
use crate::config::Settings;
use crate::error::EntrypointError;
use crate::service::data_dir;

/// Output lines kept from an engine process for failure reports.
pub const DIAGNOSTIC_TAIL: usize = 50;

const RELEASE_ATTEMPTS: usize = 25;
const RELEASE_INTERVAL: Duration = Duration::from_millis(200);

/// The `mongod` binary driven through its config file.
pub struct Mongod {
    settings: Settings,
    shell: MongoShell,
    extra_args: Vec<String>,
}

impl Mongod {
    pub fn new(settings: Settings) -> Self {
        let shell = MongoShell::local(settings.shell_bin.clone(), settings.port);
        Self {
            settings,
            shell,
            extra_args: Vec::new(),
        }
    }

    /// Arguments appended to the final engine command line only.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn args(&self, phase: Phase) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            self.settings.config_path.display().to_string(),
        ];
        match phase {
            Phase::Temporary => args.extend(["--bind_ip".to_string(), "127.0.0.1".to_string()]),
            Phase::Final => {
                args.extend([
                    "--bind_ip".to_string(),
                    "0.0.0.0".to_string(),
                    "--auth".to_string(),
                ]);
                args.extend(self.extra_args.iter().cloned());
            }
        }
        args
    }
}

#[async_trait]
impl Engine for Mongod {
    type Process = MongodProcess;

    async fn launch(&self, phase: Phase) -> Result<MongodProcess, EntrypointError> {
        let mut command = Command::new(&self.settings.bin);
        command.args(self.args(phase)).stdin(Stdio::null());
        match phase {
            // Captured so a failed bootstrap can report what the engine said.
            Phase::Temporary => command.stdout(Stdio::piped()).stderr(Stdio::piped()),
            Phase::Final => command.stdout(Stdio::inherit()).stderr(Stdio::inherit()),
        };

        let process = MongodProcess::spawn(&self.settings.bin, command)?;
        info!(
            phase = phase.name(),
            pid = ?process.pid(),
            config = %self.settings.config_path.display(),
            "engine started"
        );
        Ok(process)
    }

    async fn probe(&self) -> Result<(), EntrypointError> {
        self.shell.ping().await.map_err(|e| match e {
            EntrypointError::ShellFailed { output, .. } => EntrypointError::Unreachable(output),
            other => other,
        })
    }

    async fn eval(&self, database: &str, script: &str) -> Result<String, EntrypointError> {
        self.shell.eval(database, script).await
    }

    async fn await_release(&self) -> Result<(), EntrypointError> {
        data_dir::await_lock_release(
            &self.settings.lock_path(),
            RELEASE_ATTEMPTS,
            RELEASE_INTERVAL,
        )
        .await
    }
}

/// A running `mongod` child. Its exit is observed by a background task and
/// published through a watch channel, so every method takes `&self`.
#[derive(Debug)]
pub struct MongodProcess {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    tail: Arc<Mutex<VecDeque<String>>>,
}

impl MongodProcess {
    pub fn spawn(program: &str, mut command: Command) -> Result<Self, EntrypointError> {
        let mut child = command.spawn().map_err(|source| EntrypointError::Spawn {
            program: program.to_string(),
            source,
        })?;
        let pid = child.id();
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(DIAGNOSTIC_TAIL)));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tail.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    debug!(?pid, %status, "engine process exited");
                    let _ = exit_tx.send(Some(status));
                }
                Err(e) => warn!(?pid, error = %e, "failed to wait for engine process"),
            }
        });

        Ok(Self { pid, exit_rx, tail })
    }
}

#[async_trait]
impl EngineProcess for MongodProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit_rx.borrow()
    }

    fn diagnostics(&self) -> Vec<String> {
        match self.tail.lock() {
            Ok(tail) => tail.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    async fn wait(&self) -> Result<ExitStatus, EntrypointError> {
        let mut rx = self.exit_rx.clone();
        let status = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EntrypointError::Io(std::io::Error::other("engine exit status lost")))?;
        Ok(status.unwrap_or_default())
    }

    async fn terminate(&self, timeout: Duration) -> Result<ExitStatus, EntrypointError> {
        if let Some(status) = self.exit_status() {
            return Ok(status);
        }
        if let Some(pid) = self.pid {
            let pid = i32::try_from(pid).map_err(|_| Errno::ESRCH)?;
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                // Exited between the check above and the signal.
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(e.into()),
            }
        }
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| EntrypointError::ShutdownTimeout(timeout))?
    }
}

async fn forward_lines<R>(reader: R, tail: Arc<Mutex<VecDeque<String>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "mongod", "{}", line);
        let mut tail = match tail.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if tail.len() == DIAGNOSTIC_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
