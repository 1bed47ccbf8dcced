use thiserror::Error;

/// Why an inbound message was dropped. None of these are retried.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("payload is not a flat JSON object: {0}")]
    Malformed(String),

    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("no route for topic {0}")]
    UnknownTopic(String),

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl IngestError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        IngestError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Validation problems are the sender's fault; storage problems are ours.
    pub fn is_validation(&self) -> bool {
        !matches!(self, IngestError::Storage(_))
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
