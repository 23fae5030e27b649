use thiserror::Error;

pub type Result<T> = std::result::Result<T, TreeLogError>;

#[derive(Debug, Error)]
pub enum TreeLogError {
    #[error("lifecycle violation: {0}")]
    Lifecycle(&'static str),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
