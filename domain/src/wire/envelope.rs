//! JSON envelopes carried on the prompt and answer queues and the cancel exchange.
//!
//! Field names are camelCase so that the payloads stay readable by the
//! TypeScript services sharing the broker.

use crate::answer::AnswerFragment;
use crate::core::error::DomainError;
use crate::prompt::{Prompt, PromptId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct PromptEnvelope {
    id: PromptId,
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerEnvelope {
    prompt_id: PromptId,
    sequence: u64,
    text: String,
    is_final: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelEnvelope {
    prompt_id: PromptId,
}

/// How a prompt payload was interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedPrompt {
    /// A JSON envelope carrying its own correlation token.
    Correlated(Prompt),
    /// Bare UTF-8 text from a legacy publisher; a token was generated here
    /// and nothing upstream knows it.
    Uncorrelated(Prompt),
}

impl DecodedPrompt {
    pub fn prompt(&self) -> &Prompt {
        match self {
            DecodedPrompt::Correlated(p) | DecodedPrompt::Uncorrelated(p) => p,
        }
    }

    pub fn into_prompt(self) -> Prompt {
        match self {
            DecodedPrompt::Correlated(p) | DecodedPrompt::Uncorrelated(p) => p,
        }
    }

    pub fn is_correlated(&self) -> bool {
        matches!(self, DecodedPrompt::Correlated(_))
    }
}

pub fn encode_prompt(prompt: &Prompt) -> Vec<u8> {
    let envelope = PromptEnvelope {
        id: prompt.id().clone(),
        text: prompt.text().to_string(),
    };
    // Plain structs of strings cannot fail to serialize
    serde_json::to_vec(&envelope).unwrap_or_default()
}

/// Decode a prompt payload, accepting bare text from legacy publishers.
pub fn decode_prompt(payload: &[u8]) -> Result<DecodedPrompt, DomainError> {
    if let Ok(envelope) = serde_json::from_slice::<PromptEnvelope>(payload) {
        if envelope.id.as_str().trim().is_empty() {
            return Err(DomainError::EmptyPromptId);
        }
        return Ok(DecodedPrompt::Correlated(Prompt::from_wire(
            envelope.id,
            envelope.text,
        )));
    }

    let text = std::str::from_utf8(payload)
        .map_err(|e| DomainError::MalformedPayload(format!("prompt is not UTF-8: {}", e)))?;
    Ok(DecodedPrompt::Uncorrelated(Prompt::from_wire(
        PromptId::generate(),
        text.to_string(),
    )))
}

pub fn encode_fragment(fragment: &AnswerFragment) -> Vec<u8> {
    let envelope = AnswerEnvelope {
        prompt_id: fragment.prompt_id.clone(),
        sequence: fragment.sequence,
        text: fragment.text.clone(),
        is_final: fragment.is_final,
    };
    serde_json::to_vec(&envelope).unwrap_or_default()
}

pub fn decode_fragment(payload: &[u8]) -> Result<AnswerFragment, DomainError> {
    let envelope: AnswerEnvelope = serde_json::from_slice(payload)
        .map_err(|e| DomainError::MalformedPayload(format!("answer envelope: {}", e)))?;
    if envelope.prompt_id.as_str().trim().is_empty() {
        return Err(DomainError::EmptyPromptId);
    }
    Ok(AnswerFragment::new(
        envelope.prompt_id,
        envelope.sequence,
        envelope.text,
        envelope.is_final,
    ))
}

pub fn encode_cancel(prompt_id: &PromptId) -> Vec<u8> {
    let envelope = CancelEnvelope {
        prompt_id: prompt_id.clone(),
    };
    serde_json::to_vec(&envelope).unwrap_or_default()
}

pub fn decode_cancel(payload: &[u8]) -> Result<PromptId, DomainError> {
    let envelope: CancelEnvelope = serde_json::from_slice(payload)
        .map_err(|e| DomainError::MalformedPayload(format!("cancel envelope: {}", e)))?;
    PromptId::try_new(envelope.prompt_id.as_str())
}
