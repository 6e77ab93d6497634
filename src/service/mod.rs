//! Container start: config rendering, data directory checks, user
//! provisioning and the bootstrap sequence that ties them together.

pub mod config_renderer;
pub mod data_dir;
pub mod provision;
pub mod sequencer;
pub mod shutdown;

pub use config_renderer::ConfigRenderer;
pub use sequencer::{Sequencer, supervise};
pub use shutdown::Shutdown;
