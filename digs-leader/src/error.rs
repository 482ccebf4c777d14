use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeaderLockError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("etcd rpc timed out")]
    Timeout,

    #[error("kmc decryption failed: {0}")]
    Decryption(String),

    #[error("lease operation rejected: {0}")]
    Lease(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LeaderLockResult<T> = Result<T, LeaderLockError>;
