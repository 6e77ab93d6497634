use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::EntrypointError;

pub const SETTINGS_ENV_PREFIX: &str = "MONGOD_";

/// Ownership the image gives the data directory; never changed at runtime.
pub const DATA_DIR_UID: u32 = 184;
pub const DATA_DIR_GID: u32 = 998;

/// Runtime settings of the entrypoint itself, layered from defaults and
/// `MONGOD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub port: u16,
    pub bin: String,
    pub shell_bin: String,
    pub ready_attempts: usize,
    pub ready_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/mongod.conf"),
            data_dir: PathBuf::from("/var/lib/mongodb/data"),
            port: 27017,
            bin: "mongod".to_string(),
            shell_bin: "mongo".to_string(),
            ready_attempts: 60,
            ready_interval_ms: 1000,
            shutdown_timeout_secs: 60,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX))
    }

    pub fn load() -> Result<Self, EntrypointError> {
        let settings: Settings = Self::figment().extract()?;
        settings.validate()
    }

    fn validate(self) -> Result<Self, EntrypointError> {
        if self.ready_attempts == 0 {
            return Err(EntrypointError::InvalidValue {
                name: "MONGOD_READY_ATTEMPTS",
                value: self.ready_attempts.to_string(),
                reason: "at least one readiness attempt is required",
            });
        }
        if self.port == 0 {
            return Err(EntrypointError::InvalidValue {
                name: "MONGOD_PORT",
                value: self.port.to_string(),
                reason: "port must be non-zero",
            });
        }
        Ok(self)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Lock file the engine holds inside the data directory while running.
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("mongod.lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_without_environment() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load().map_err(|e| e.to_string())?;
            assert_eq!(settings, Settings::default());
            assert_eq!(settings.lock_path(), PathBuf::from("/var/lib/mongodb/data/mongod.lock"));
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("MONGOD_PORT", "28017");
            jail.set_env("MONGOD_READY_ATTEMPTS", "5");
            jail.set_env("MONGOD_READY_INTERVAL_MS", "250");
            jail.set_env("MONGOD_DATA_DIR", "/data/db");
            let settings = Settings::load().map_err(|e| e.to_string())?;
            assert_eq!(settings.port, 28017);
            assert_eq!(settings.ready_attempts, 5);
            assert_eq!(settings.ready_interval(), Duration::from_millis(250));
            assert_eq!(settings.data_dir, PathBuf::from("/data/db"));
            Ok(())
        });
    }

    #[test]
    fn recognized_database_variables_do_not_leak_into_settings() {
        Jail::expect_with(|jail| {
            jail.set_env("MONGODB_USER", "user1");
            jail.set_env("MONGODB_QUIET", "true");
            let settings = Settings::load().map_err(|e| e.to_string())?;
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn zero_attempts_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("MONGOD_READY_ATTEMPTS", "0");
            let err = Settings::load().expect_err("zero attempts must fail");
            assert!(err.to_string().contains("MONGOD_READY_ATTEMPTS"));
            Ok(())
        });
    }
}
