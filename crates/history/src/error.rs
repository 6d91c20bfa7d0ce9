use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid history entry at index {index}: {reason}")]
    Validation { index: usize, reason: String },
}

impl Error {
    #[must_use]
    pub fn validation(index: usize, reason: impl Into<String>) -> Self {
        Self::Validation {
            index,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
