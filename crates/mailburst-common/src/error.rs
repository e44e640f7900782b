//! Error types for Mailburst

use thiserror::Error;

/// Main error type for Mailburst
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Send rejected: {0}")]
    SendRejected(String),

    #[error("Transient send failure: {0}")]
    SendTransient(String),

    #[error("Queue full for tenant {0}")]
    QueueFull(uuid::Uuid),

    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error("Job {0} is already in a terminal state")]
    AlreadyTerminal(uuid::Uuid),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Mailburst
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string emitted on the event stream
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::TransportUnavailable(_) => "TRANSPORT_UNAVAILABLE",
            Error::SendRejected(_) => "SEND_REJECTED",
            Error::SendTransient(_) => "SEND_TRANSIENT",
            Error::QueueFull(_) => "QUEUE_FULL",
            Error::JobNotFound(_) => "JOB_NOT_FOUND",
            Error::AlreadyTerminal(_) => "ALREADY_TERMINAL",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(Error::QueueFull(id).code(), "QUEUE_FULL");
        assert_eq!(Error::JobNotFound(id).code(), "JOB_NOT_FOUND");
        assert_eq!(
            Error::TransportUnavailable("auth".into()).code(),
            "TRANSPORT_UNAVAILABLE"
        );
    }
}
