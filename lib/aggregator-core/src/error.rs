use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid destination address: {0}")]
    InvalidDestination(String),

    #[error("Invalid trust bundle: {0}")]
    InvalidTrustBundle(String),

    #[error("Trust bundle contains no certificates")]
    EmptyTrustBundle,

    #[error("Invalid request path: {0}")]
    InvalidRequestPath(String),
}
