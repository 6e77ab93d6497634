pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod harness;
pub mod service;
pub mod types;

pub use config::Settings;
pub use error::EntrypointError;
pub use types::MongoEnv;
