//! Requirements-clarification exchange log.

use serde::{Deserialize, Serialize};

/// Marker the agent emits once it has no more questions.
pub const INTERVIEW_COMPLETE_SENTINEL: &str = "INTERVIEW_COMPLETE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewSession {
    feature_description: String,
    exchanges: Vec<Exchange>,
    is_complete: bool,
}

impl InterviewSession {
    pub fn new(feature_description: impl Into<String>) -> Self {
        Self {
            feature_description: feature_description.into(),
            exchanges: Vec::new(),
            is_complete: false,
        }
    }

    pub fn feature_description(&self) -> &str {
        &self.feature_description
    }

    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    /// Append an exchange. Ignored once the interview is complete.
    pub fn record(&mut self, question: impl Into<String>, answer: impl Into<String>) -> bool {
        if self.is_complete {
            return false;
        }
        self.exchanges.push(Exchange {
            question: question.into(),
            answer: answer.into(),
        });
        true
    }

    /// Monotonic: once complete, the session never reopens.
    pub fn mark_complete(&mut self) {
        self.is_complete = true;
    }

    /// Scan assistant text for the completion sentinel.
    pub fn observe_text(&mut self, text: &str) -> bool {
        if !self.is_complete && text.contains(INTERVIEW_COMPLETE_SENTINEL) {
            self.is_complete = true;
            return true;
        }
        false
    }

    /// Render the exchanges as a Q/A transcript for later prompts.
    pub fn transcript(&self) -> String {
        self.exchanges
            .iter()
            .map(|ex| format!("Q: {}\nA: {}", ex.question.trim(), ex.answer.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
