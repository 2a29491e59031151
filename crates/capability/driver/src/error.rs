//! 驱动层错误类型。

use gw_storage::StorageError;

/// 驱动错误。
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("config error: {0}")]
    Config(String),
    #[error("unsupported driver type: {0}")]
    UnknownType(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("driver already running: {0}")]
    AlreadyRunning(String),
    #[error("driver not running: {0}")]
    NotRunning(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl DriverError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}
