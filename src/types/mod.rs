pub mod env;
pub mod state;

pub use env::{Credentials, MongoEnv, StorageFlags};
pub use state::{BootMachine, BootState, DataDirState};
