use backon::{ConstantBuilder, Retryable};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::engine::{Engine, EngineProcess, Phase, exit_code};
use crate::error::{EntrypointError, IsRetryable};
use crate::service::provision::provision_users;
use crate::service::shutdown::Shutdown;
use crate::types::{BootMachine, BootState, DataDirState, MongoEnv};

/// Drives one container start from the detected data directory state to a
/// running final engine.
pub struct Sequencer<E: Engine> {
    engine: E,
    env: MongoEnv,
    settings: Settings,
    machine: BootMachine,
}

impl<E: Engine> Sequencer<E> {
    pub fn new(engine: E, env: MongoEnv, settings: Settings, data_dir: DataDirState) -> Self {
        Self {
            engine,
            env,
            settings,
            machine: BootMachine::new(data_dir),
        }
    }

    pub fn state(&self) -> BootState {
        self.machine.state()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Bootstrap if the data directory is empty, then launch the final engine.
    /// A stop request during bootstrap stops the temporary engine and fails.
    pub async fn start(&mut self, shutdown: &mut Shutdown) -> Result<E::Process, EntrypointError> {
        if self.machine.needs_bootstrap() {
            self.bootstrap(shutdown).await?;
        } else {
            info!(data_dir = %self.settings.data_dir.display(), "data directory populated; skipping bootstrap");
        }
        self.machine.advance(BootState::Running)?;
        self.engine.launch(Phase::Final).await
    }

    async fn bootstrap(&mut self, shutdown: &mut Shutdown) -> Result<(), EntrypointError> {
        self.machine.advance(BootState::Bootstrapping)?;
        let started = Utc::now();

        let temp = self.engine.launch(Phase::Temporary).await?;
        let provisioned = tokio::select! {
            result = self.ready_and_provision(&temp) => result,
            name = shutdown.recv() => {
                warn!(signal = name, "stop requested during bootstrap");
                Err(EntrypointError::Interrupted(name))
            }
        };
        if provisioned.is_ok() {
            self.machine.advance(BootState::UserProvisioned)?;
        }

        // The temporary instance is stopped on every path; a failed stop never
        // hides the provisioning error that came first.
        let stopped = self.handoff(&temp).await;
        let created = match (provisioned, stopped) {
            (Ok(created), Ok(())) => created,
            (Err(e), Ok(())) => return Err(e),
            (Ok(_), Err(stop_err)) => return Err(stop_err),
            (Err(e), Err(stop_err)) => {
                warn!(error = %stop_err, "temporary engine did not stop cleanly");
                return Err(e);
            }
        };

        info!(
            users = ?created,
            database = %self.env.database,
            elapsed_ms = (Utc::now() - started).num_milliseconds(),
            "bootstrap complete"
        );
        Ok(())
    }

    async fn ready_and_provision(&self, temp: &E::Process) -> Result<Vec<String>, EntrypointError> {
        self.wait_ready(temp).await?;
        provision_users(&self.engine, &self.env).await
    }

    /// Poll until the temporary engine answers, within the configured budget.
    async fn wait_ready(&self, temp: &E::Process) -> Result<(), EntrypointError> {
        let attempts = self.settings.ready_attempts.max(1);
        let policy = ConstantBuilder::default()
            .with_delay(self.settings.ready_interval())
            .with_max_times(attempts - 1);
        let engine = &self.engine;

        let result = (move || async move {
            if let Some(status) = temp.exit_status() {
                return Err(EntrypointError::EngineExited {
                    phase: Phase::Temporary.name(),
                    status,
                });
            }
            engine.probe().await
        })
        .retry(policy)
        .when(|e: &EntrypointError| e.is_retryable())
        .notify(|err, dur: Duration| {
            debug!(error = %err, "engine not ready, retrying in {:?}", dur);
        })
        .await;

        match result {
            Ok(()) => {
                info!("temporary engine accepting local connections");
                Ok(())
            }
            Err(e) => {
                report_diagnostics(temp);
                match e {
                    EntrypointError::Unreachable(last) => {
                        Err(EntrypointError::NotReady { attempts, last })
                    }
                    other => Err(other),
                }
            }
        }
    }

    /// Stop the temporary engine gracefully and wait until it released the
    /// data directory.
    async fn handoff(&self, temp: &E::Process) -> Result<(), EntrypointError> {
        let status = temp.terminate(self.settings.shutdown_timeout()).await?;
        info!(%status, "temporary engine stopped");
        self.engine.await_release().await
    }
}

fn report_diagnostics<P: EngineProcess>(process: &P) {
    let lines = process.diagnostics();
    if lines.is_empty() {
        error!("engine produced no output");
        return;
    }
    for line in lines {
        error!(target: "mongod", "{}", line);
    }
}

/// Wait for the final engine, stopping it with SIGTERM on a stop request.
/// Returns the exit code the container should report.
pub async fn supervise<P: EngineProcess>(
    process: P,
    grace: Duration,
    shutdown: &mut Shutdown,
) -> Result<i32, EntrypointError> {
    let status = tokio::select! {
        status = process.wait() => status?,
        name = shutdown.recv() => {
            info!(signal = name, "stopping engine");
            process.terminate(grace).await?
        }
    };

    let code = exit_code(status);
    if code == 0 {
        info!("engine shut down");
    } else {
        error!(%status, code, "engine exited");
    }
    Ok(code)
}
