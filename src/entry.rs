use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use tracing::{error, info};

use crate::config::Settings;
use crate::engine::Mongod;
use crate::error::EntrypointError;
use crate::service::{ConfigRenderer, Sequencer, Shutdown, data_dir, supervise};
use crate::types::MongoEnv;

pub const SERVER_MODE: &str = "mongod";

/// What the container was asked to do, from its argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryMode {
    /// Run the database; trailing arguments go to the final engine.
    Server { extra_args: Vec<String> },
    /// Any other command, executed in place of the entrypoint.
    Passthrough(Vec<OsString>),
}

impl EntryMode {
    /// `mongod` arguments must be UTF-8: a server that cannot take them is a
    /// configuration error, never a silent switch to passthrough.
    pub fn from_args<I>(args: I) -> Result<Self, EntrypointError>
    where
        I: IntoIterator<Item = OsString>,
    {
        let args: Vec<OsString> = args.into_iter().collect();
        match args.split_first() {
            None => Ok(Self::Server {
                extra_args: Vec::new(),
            }),
            Some((first, rest)) if first == SERVER_MODE => {
                let extra_args = rest
                    .iter()
                    .map(|arg| {
                        arg.clone()
                            .into_string()
                            .map_err(|raw| EntrypointError::InvalidValue {
                                name: "mongod argument",
                                value: raw.to_string_lossy().into_owned(),
                                reason: "server arguments must be valid UTF-8",
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Server { extra_args })
            }
            Some(_) => Ok(Self::Passthrough(args)),
        }
    }
}

/// Render config, bootstrap if needed, and supervise the final engine.
/// Returns the exit code of the engine.
pub async fn run_server(settings: Settings, extra_args: Vec<String>) -> Result<i32, EntrypointError> {
    let mut shutdown = Shutdown::install()?;
    let env = MongoEnv::from_process_env()?;
    info!(
        user = %env.app.user,
        database = %env.database,
        admin = env.admin_password.is_some(),
        data_dir = %settings.data_dir.display(),
        "starting database container"
    );

    data_dir::ensure_usable(&settings.data_dir)?;
    ConfigRenderer::new(&settings, &env.flags).write_to(&settings.config_path)?;
    let state = data_dir::inspect(&settings.data_dir)?;

    let engine = Mongod::new(settings.clone()).with_extra_args(extra_args);
    let grace = settings.shutdown_timeout();
    let mut sequencer = Sequencer::new(engine, env, settings, state);
    let process = sequencer.start(&mut shutdown).await?;
    supervise(process, grace, &mut shutdown).await
}

/// Replace this process with `command`. Only returns on failure.
pub fn exec_passthrough(command: &[OsString]) -> i32 {
    let Some((program, args)) = command.split_first() else {
        return 0;
    };
    let err = std::process::Command::new(program).args(args).exec();
    error!(program = ?program, error = %err, "failed to execute command");
    if err.kind() == std::io::ErrorKind::NotFound {
        127
    } else {
        126
    }
}
