//! Prompt value objects

use crate::core::error::DomainError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation token linking a prompt to the fragments produced for it.
///
/// Opaque to the relay: any non-empty string is accepted, so callers may
/// bring their own identifiers (e.g. a database row id from the HTTP layer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptId(String);

impl PromptId {
    /// Generate a fresh random token (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing token, rejecting empty or whitespace-only values.
    pub fn try_new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::EmptyPromptId);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PromptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PromptId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_new(s)
    }
}

/// A user prompt travelling through the `prompt` queue (Value Object)
///
/// Created by the external caller and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    id: PromptId,
    text: String,
}

impl Prompt {
    /// Create a prompt, rejecting empty or whitespace-only text.
    pub fn try_new(id: PromptId, text: impl Into<String>) -> Result<Self, DomainError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(DomainError::EmptyPrompt);
        }
        Ok(Self { id, text })
    }

    /// Rebuild a prompt received from the wire.
    ///
    /// No validation: whatever the publisher sent is what the generator
    /// must answer, even an empty string.
    pub(crate) fn from_wire(id: PromptId, text: String) -> Self {
        Self { id, text }
    }

    pub fn id(&self) -> &PromptId {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}
