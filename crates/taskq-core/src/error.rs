use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskqError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TaskqError {
    /// Short machine-readable code, used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            TaskqError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskqError>;
