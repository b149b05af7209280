pub mod config;
pub mod daemon;
pub mod directory;
pub mod error;
pub mod identity;
pub mod scheduler;
pub mod shutdown;
pub mod status;
pub mod store;
pub mod worker;

pub use config::DaemonConfig;
pub use daemon::{Daemon, Services};
pub use error::{ArchiverError, Result};
