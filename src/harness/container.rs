use backon::{ConstantBuilder, Retryable};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use crate::engine::MongoShell;
use crate::error::{EntrypointError, IsRetryable};
use crate::types::Credentials;

pub const DEFAULT_PORT: u16 = 27017;
const CONNECTION_ATTEMPTS: usize = 60;
const CONNECTION_ATTEMPT_DELAY: Duration = Duration::from_secs(2);

/// How to start one container of the image under test.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    image: String,
    env: BTreeMap<String, String>,
    user: Option<String>,
    volume: Option<(PathBuf, String)>,
    command: Vec<String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            env: BTreeMap::new(),
            user: None,
            volume: None,
            command: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Run as an arbitrary `uid[:gid]` instead of the image default.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn volume(mut self, host: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        self.volume = Some((host.into(), target.into()));
        self
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        if let Some(user) = &self.user {
            args.extend(["--user".to_string(), user.clone()]);
        }
        if let Some((host, target)) = &self.volume {
            args.extend(["-v".to_string(), format!("{}:{target}:Z", host.display())]);
        }
        for (key, value) in &self.env {
            args.extend(["-e".to_string(), format!("{key}={value}")]);
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }

    pub async fn launch(&self) -> Result<Container, EntrypointError> {
        let id = docker(&self.run_args()).await?;
        info!(image = %self.image, container = %short(&id), "container launched");
        let ip = docker(&[
            "inspect".to_string(),
            "--format".to_string(),
            "{{.NetworkSettings.IPAddress}}".to_string(),
            id.clone(),
        ])
        .await?;
        Ok(Container { id, ip })
    }
}

/// A launched container. Removed (with its anonymous volumes) on drop.
#[derive(Debug)]
pub struct Container {
    id: String,
    ip: String,
}

impl Container {
    /// Client connecting over the container network, run inside the container.
    pub fn shell(&self) -> MongoShell {
        MongoShell::wrapped(
            "docker",
            vec!["exec".to_string(), self.id.clone(), "mongo".to_string()],
            self.ip.clone(),
            DEFAULT_PORT,
        )
    }

    pub fn shell_as(&self, creds: &Credentials, auth_db: &str) -> MongoShell {
        self.shell().authenticated(creds.clone(), auth_db)
    }

    /// Connection URI for external clients, with the password left out.
    pub fn connection_uri(&self, user: &str, database: &str) -> Result<Url, EntrypointError> {
        let mut url = Url::parse(&format!("mongodb://{}:{DEFAULT_PORT}/", self.ip))
            .map_err(|e| EntrypointError::Harness(format!("bad address {}: {e}", self.ip)))?;
        url.set_username(user)
            .map_err(|_| EntrypointError::Harness(format!("cannot encode user {user}")))?;
        url.set_path(database);
        Ok(url)
    }

    /// Poll with the client until the engine accepts network connections.
    pub async fn wait_reachable(&self) -> Result<(), EntrypointError> {
        self.wait_reachable_with(CONNECTION_ATTEMPTS, CONNECTION_ATTEMPT_DELAY)
            .await
    }

    pub async fn wait_reachable_with(
        &self,
        attempts: usize,
        delay: Duration,
    ) -> Result<(), EntrypointError> {
        let shell = &self.shell();
        let policy = ConstantBuilder::default()
            .with_delay(delay)
            .with_max_times(attempts.saturating_sub(1));

        let this = self;
        (move || async move {
            if !this.is_running().await? {
                let logs = this.logs().await.unwrap_or_default();
                return Err(EntrypointError::Harness(format!(
                    "container {} exited before becoming reachable:\n{logs}",
                    short(&this.id)
                )));
            }
            shell.ping().await.map_err(|e| match e {
                EntrypointError::ShellFailed { output, .. } => EntrypointError::Unreachable(output),
                other => other,
            })
        })
        .retry(policy)
        .when(|e: &EntrypointError| e.is_retryable())
        .notify(|err, dur: Duration| {
            debug!(container = %short(&self.id), error = %err, "not reachable, retrying in {:?}", dur);
        })
        .await?;

        info!(container = %short(&self.id), ip = %self.ip, "container reachable");
        Ok(())
    }

    pub async fn is_running(&self) -> Result<bool, EntrypointError> {
        let state = docker(&[
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}}".to_string(),
            self.id.clone(),
        ])
        .await?;
        Ok(state == "true")
    }

    /// Wait for the container to exit and return its exit code.
    pub async fn wait_exit(&self) -> Result<i32, EntrypointError> {
        let code = docker(&["wait".to_string(), self.id.clone()]).await?;
        code.parse()
            .map_err(|_| EntrypointError::Harness(format!("unexpected exit code {code:?}")))
    }

    pub async fn logs(&self) -> Result<String, EntrypointError> {
        docker(&["logs".to_string(), self.id.clone()]).await
    }

    pub async fn exec(&self, command: &[&str]) -> Result<String, EntrypointError> {
        let mut args = vec!["exec".to_string(), self.id.clone()];
        args.extend(command.iter().map(|s| s.to_string()));
        docker(&args).await
    }

    pub async fn read_file(&self, path: &str) -> Result<String, EntrypointError> {
        self.exec(&["cat", path]).await
    }

    /// Stop gracefully (SIGTERM, then the docker timeout).
    pub async fn stop(&self) -> Result<(), EntrypointError> {
        docker(&["stop".to_string(), self.id.clone()]).await.map(|_| ())
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        let removed = std::process::Command::new("docker")
            .args(["rm", "-f", "-v", &self.id])
            .output();
        if let Err(e) = removed {
            warn!(container = %short(&self.id), error = %e, "failed to remove container");
        }
    }
}

async fn docker(args: &[String]) -> Result<String, EntrypointError> {
    let output = Command::new("docker")
        .args(args)
        .output()
        .await
        .map_err(|source| EntrypointError::Spawn {
            program: "docker".to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(EntrypointError::ShellFailed {
            program: format!("docker {}", args.first().map(String::as_str).unwrap_or("")),
            status: output.status,
            output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
