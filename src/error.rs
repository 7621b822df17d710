use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
