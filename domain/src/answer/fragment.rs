//! Answer fragment value object

use crate::prompt::PromptId;

/// One unit of a segmented answer stream.
///
/// Fragments of a prompt are numbered from 0 and exactly one of them, the
/// one with the highest sequence, carries `is_final`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerFragment {
    pub prompt_id: PromptId,
    pub sequence: u64,
    pub text: String,
    pub is_final: bool,
}

impl AnswerFragment {
    pub fn new(
        prompt_id: PromptId,
        sequence: u64,
        text: impl Into<String>,
        is_final: bool,
    ) -> Self {
        Self {
            prompt_id,
            sequence,
            text: text.into(),
            is_final,
        }
    }
}

impl std::fmt::Display for AnswerFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{}{}",
            self.prompt_id,
            self.sequence,
            if self.is_final { " (final)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_marks_final() {
        let id = PromptId::try_new("p1").unwrap();
        let mid = AnswerFragment::new(id.clone(), 1, "b", false);
        let last = AnswerFragment::new(id, 2, "c", true);
        assert_eq!(mid.to_string(), "p1#1");
        assert_eq!(last.to_string(), "p1#2 (final)");
    }
}
