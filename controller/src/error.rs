use allocator::{ConfigError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("pod identity error: {0}")]
    Identity(String),

    #[error("tls setup error: {0}")]
    Tls(std::io::Error),

    #[error("webhook server error: {0}")]
    Server(std::io::Error),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
