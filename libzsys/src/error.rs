use thiserror::Error;

/// The public error taxonomy returned from library operations and mapped
/// onto RPC wire status codes by the daemon.
#[derive(Error, Debug)]
pub enum ZsysError {
    #[error("dataset not found: {0}")]
    NotFound(String),

    #[error("conflicting operation on {0}: {1}")]
    Conflict(String, String),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("pool operation failed: {0}")]
    PoolError(#[from] anyhow::Error),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("usage error: {0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, ZsysError>;

impl ZsysError {
    /// Exit code this error should translate to when surfaced from a CLI
    /// entry point: 0 success, 1 any operation error, 2 usage error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ZsysError::Usage(_) => 2,
            _ => 1,
        }
    }
}
