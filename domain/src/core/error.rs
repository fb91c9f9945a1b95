//! Domain error types

use thiserror::Error;

/// Domain-level errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DomainError {
    #[error("Prompt text cannot be empty")]
    EmptyPrompt,

    #[error("Correlation token cannot be empty")]
    EmptyPromptId,

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let error = DomainError::InvalidTransition {
            from: "received",
            to: "acknowledged",
        };
        assert_eq!(
            error.to_string(),
            "Invalid phase transition: received -> acknowledged"
        );
    }
}
