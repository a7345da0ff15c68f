use thiserror::Error;

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("intercept configuration error: {0}")]
    Config(String),
    #[error("intercept runtime error: {0}")]
    Runtime(String),
    #[error("intercept IO error: {0}")]
    Io(#[from] std::io::Error),
}
