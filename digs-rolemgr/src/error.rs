use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoleManagerError {
    #[error(transparent)]
    Core(#[from] digs_core::DigsError),

    #[error("unrecognized model family: {0}")]
    UnknownModelFamily(String),

    #[error("proportion calculator has no simulator configured")]
    NoSimulator,
}

pub type RoleManagerResult<T> = Result<T, RoleManagerError>;
