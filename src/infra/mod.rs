pub mod accounts;
pub mod config;
pub mod lock;
pub mod logging;
pub mod storage;

pub use accounts::{AccountList, AccountsError};
pub use config::{ConfigError, ConfigManager, HarvesterConfig};
pub use lock::{LockError, LockHandle, LockStatus, RunLock};
pub use storage::SqliteSink;
