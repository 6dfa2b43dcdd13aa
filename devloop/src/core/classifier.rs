//! Deterministic classification of tasks for the test-writing step.

use serde::{Deserialize, Serialize};

use crate::core::plan::Task;

/// Test-writing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfiguration {
    /// Run the test-writing step after review.
    pub write_tests: bool,
    /// Whole-word keywords marking a task as UI work (tests are skipped).
    pub ui_keywords: Vec<String>,
}

impl Default for TestConfiguration {
    fn default() -> Self {
        Self {
            write_tests: true,
            ui_keywords: [
                "ui",
                "view",
                "button",
                "screen",
                "layout",
                "style",
                "css",
                "animation",
                "modal",
                "dialog",
                "icon",
                "theme",
                "user interface",
            ]
            .iter()
            .map(|kw| kw.to_string())
            .collect(),
        }
    }
}

/// Keyword classifier deciding whether a task is UI-only work.
#[derive(Debug, Clone)]
pub struct TaskClassifier {
    keywords: Vec<String>,
}

impl TaskClassifier {
    pub fn new<S: AsRef<str>>(keywords: &[S]) -> Self {
        let keywords = keywords
            .iter()
            .map(|kw| normalize(kw.as_ref()))
            .filter(|kw| !kw.trim().is_empty())
            .collect();
        Self { keywords }
    }

    /// Return the first keyword found in the task title or description.
    pub fn ui_keyword(&self, task: &Task) -> Option<&str> {
        let haystack = normalize(&format!("{} {}", task.title, task.description));
        self.keywords
            .iter()
            .find(|kw| haystack.contains(kw.as_str()))
            .map(|kw| kw.trim())
    }

    pub fn is_ui_task(&self, task: &Task) -> bool {
        self.ui_keyword(task).is_some()
    }
}

/// Lowercase, collapse non-alphanumeric runs to single spaces, and pad so
/// that `contains(" kw ")` only matches whole words.
fn normalize(text: &str) -> String {
    let words: Vec<String> = text
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!(" {} ", words.join(" "))
}
