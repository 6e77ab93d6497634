use std::fmt;
use tracing::info;

use crate::error::EntrypointError;

/// Whether the data directory held any engine files at container start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirState {
    Empty,
    Populated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Uninitialized,
    Bootstrapping,
    UserProvisioned,
    Running,
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Bootstrapping => "BOOTSTRAPPING",
            Self::UserProvisioned => "USER_PROVISIONED",
            Self::Running => "RUNNING",
        };
        f.write_str(s)
    }
}

/// Boot state plus the guard that decides which path out of
/// `Uninitialized` is legal.
#[derive(Debug)]
pub struct BootMachine {
    state: BootState,
    data_dir: DataDirState,
}

impl BootMachine {
    pub fn new(data_dir: DataDirState) -> Self {
        Self {
            state: BootState::Uninitialized,
            data_dir,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn needs_bootstrap(&self) -> bool {
        self.state == BootState::Uninitialized && self.data_dir == DataDirState::Empty
    }

    pub fn advance(&mut self, to: BootState) -> Result<(), EntrypointError> {
        use BootState::*;

        let allowed = match (self.state, to) {
            (Uninitialized, Bootstrapping) => self.data_dir == DataDirState::Empty,
            (Uninitialized, Running) => self.data_dir == DataDirState::Populated,
            (Bootstrapping, UserProvisioned) | (UserProvisioned, Running) => true,
            _ => false,
        };
        if !allowed {
            return Err(EntrypointError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        info!(from = %self.state, to = %to, "boot state transition");
        self.state = to;
        Ok(())
    }
}
