use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::EntrypointError;
use crate::types::Credentials;

pub const PING_SCRIPT: &str = "quit(db.runCommand({ping: 1}).ok ? 0 : 1)";

/// Invocation of the `mongo` command-line client.
///
/// `program` plus `prefix` allow wrapping the client, e.g. in `docker exec`.
#[derive(Debug, Clone)]
pub struct MongoShell {
    program: String,
    prefix: Vec<String>,
    host: String,
    port: u16,
    auth: Option<(Credentials, String)>,
}

impl MongoShell {
    pub fn local(bin: impl Into<String>, port: u16) -> Self {
        Self {
            program: bin.into(),
            prefix: Vec::new(),
            host: "127.0.0.1".to_string(),
            port,
            auth: None,
        }
    }

    pub fn wrapped(
        program: impl Into<String>,
        prefix: Vec<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            program: program.into(),
            prefix,
            host: host.into(),
            port,
            auth: None,
        }
    }

    /// Authenticate as `creds` against `auth_db`.
    pub fn authenticated(mut self, creds: Credentials, auth_db: impl Into<String>) -> Self {
        self.auth = Some((creds, auth_db.into()));
        self
    }

    pub fn args(&self, database: &str, script: &str) -> Vec<String> {
        let mut args = self.prefix.clone();
        args.extend([
            "--quiet".to_string(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ]);
        if let Some((creds, auth_db)) = &self.auth {
            args.extend([
                "-u".to_string(),
                creds.user.clone(),
                "-p".to_string(),
                creds.password.clone(),
                "--authenticationDatabase".to_string(),
                auth_db.clone(),
            ]);
        }
        args.extend([
            database.to_string(),
            "--eval".to_string(),
            script.to_string(),
        ]);
        args
    }

    /// Run `script` and return trimmed stdout; a non-zero exit becomes
    /// [`EntrypointError::ShellFailed`] carrying the client's combined output.
    pub async fn eval(&self, database: &str, script: &str) -> Result<String, EntrypointError> {
        debug!(program = %self.program, host = %self.host, database, "running shell script");
        let output = Command::new(&self.program)
            .args(self.args(database, script))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| EntrypointError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = [stdout.as_str(), stderr.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        Err(EntrypointError::ShellFailed {
            program: self.program.clone(),
            status: output.status,
            output: combined,
        })
    }

    pub async fn ping(&self) -> Result<(), EntrypointError> {
        self.eval("admin", PING_SCRIPT).await.map(|_| ())
    }
}

/// Embed `value` in a shell script as a JavaScript string literal.
pub fn js_string(value: &str) -> Result<String, EntrypointError> {
    Ok(serde_json::to_string(value)?)
}
