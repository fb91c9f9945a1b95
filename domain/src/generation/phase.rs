//! Lifecycle of one consumed prompt message in the generator.

use crate::core::error::DomainError;

/// Phase of the generator's per-message state machine.
///
/// ```text
/// Received ─▶ Generating ─▶ Publishing{n} ─▶ Acknowledged
///                  │              │
///                  └──────────────┴─▶ Failed | Cancelled
/// ```
///
/// `Failed` leaves the message for redelivery; `Cancelled` settles it after
/// an empty final fragment closed the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationPhase {
    Received,
    Generating,
    /// Publishing; `next_sequence` is the sequence of the next fragment.
    Publishing { next_sequence: u64 },
    Acknowledged,
    Failed,
    Cancelled,
}

impl GenerationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationPhase::Received => "received",
            GenerationPhase::Generating => "generating",
            GenerationPhase::Publishing { .. } => "publishing",
            GenerationPhase::Acknowledged => "acknowledged",
            GenerationPhase::Failed => "failed",
            GenerationPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationPhase::Acknowledged | GenerationPhase::Failed | GenerationPhase::Cancelled
        )
    }

    /// Number of fragments published so far in this pass.
    pub fn published(&self) -> u64 {
        match self {
            GenerationPhase::Publishing { next_sequence } => *next_sequence,
            _ => 0,
        }
    }

    /// Validate and perform a transition.
    pub fn advance(self, next: GenerationPhase) -> Result<GenerationPhase, DomainError> {
        use GenerationPhase::*;

        let allowed = match (self, next) {
            (Received, Generating) => true,
            (Generating, Publishing { next_sequence: 0 }) => true,
            (Publishing { next_sequence: a }, Publishing { next_sequence: b }) => b == a + 1,
            // At least one fragment must have gone out before the ack
            (Publishing { next_sequence }, Acknowledged) => next_sequence > 0,
            (Received | Generating | Publishing { .. }, Failed | Cancelled) => true,
            _ => false,
        };

        if allowed {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl std::fmt::Display for GenerationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationPhase::Publishing { next_sequence } => {
                write!(f, "publishing(seq={})", next_sequence)
            }
            other => write!(f, "{}", other.as_str()),
        }
    }
}
