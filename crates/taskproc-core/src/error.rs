use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskprocError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskprocError {
    /// Short error code string, stable across releases for log scraping.
    pub fn code(&self) -> &'static str {
        match self {
            TaskprocError::Config(_) => "CONFIG_ERROR",
            TaskprocError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskprocError>;
