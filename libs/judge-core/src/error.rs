use thiserror::Error;

/// Submission-level failures. Anything that can go wrong inside a single
/// test-case run is reported as outcome data instead.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("judge is at capacity, submission rejected")]
    Overloaded,

    #[error("evaluation cancelled")]
    Cancelled,

    #[error("internal judge error: {0}")]
    Internal(String),
}

impl JudgeError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        JudgeError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Message safe to show to the submitter. Host-side details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            JudgeError::Internal(_) => "execution failed".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for JudgeError {
    fn from(e: std::io::Error) -> Self {
        JudgeError::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JudgeError>;
