use mimalloc::MiMalloc;
use mongodb_container::Settings;
use mongodb_container::entry::{self, EntryMode};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = Settings::load();
    let loglevel = settings
        .as_ref()
        .map(|s| s.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(loglevel));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    let code = match EntryMode::from_args(std::env::args_os().skip(1)) {
        Err(e) => {
            error!(error = %e, "invalid command line");
            e.exit_code()
        }
        Ok(EntryMode::Passthrough(command)) => entry::exec_passthrough(&command),
        Ok(EntryMode::Server { extra_args }) => match settings {
            Err(e) => {
                error!(error = %e, "invalid entrypoint settings");
                e.exit_code()
            }
            Ok(settings) => {
                info!(
                    config_path = %settings.config_path.display(),
                    port = settings.port,
                    ready_attempts = settings.ready_attempts,
                    ready_interval_ms = settings.ready_interval_ms,
                    "entrypoint starting"
                );
                match entry::run_server(settings, extra_args).await {
                    Ok(code) => code,
                    Err(e) => {
                        error!(error = %e, kind = ?e.kind(), "container start failed");
                        e.exit_code()
                    }
                }
            }
        },
    };
    std::process::exit(code);
}
