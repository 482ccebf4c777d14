pub mod error;
pub mod kmc_secure_string;
pub mod leader_lock;

pub use error::{LeaderLockError, LeaderLockResult};
pub use kmc_secure_string::{CredentialDecryptor, PassthroughDecryptor, SecureString};
pub use leader_lock::{EtcdClientOps, EtcdOps, LeaderLock, LockChangeCallback};
