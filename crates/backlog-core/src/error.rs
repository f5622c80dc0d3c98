use thiserror::Error;

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BacklogError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            BacklogError::Config(_) => "CONFIG_ERROR",
            BacklogError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, BacklogError>;
