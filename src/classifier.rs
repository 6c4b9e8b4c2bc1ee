//! Classifier interface — turns raw inbound text into a task classification.
//!
//! The real classifier lives upstream; this crate only needs its contract and
//! a default that forwards the message unchanged.

use async_trait::async_trait;

use crate::tasks::model::Classification;

/// Assigns intent, autonomy, and an execution prompt to a raw message.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Classification;
}

/// Classifier that uses the message itself as the execution prompt.
#[derive(Debug, Clone)]
pub struct PassthroughClassifier {
    pub intent: String,
    pub autonomy_level: String,
}

impl Default for PassthroughClassifier {
    fn default() -> Self {
        Self {
            intent: "general".to_string(),
            autonomy_level: "auto".to_string(),
        }
    }
}

#[async_trait]
impl Classifier for PassthroughClassifier {
    async fn classify(&self, text: &str) -> Classification {
        let summary: String = text.lines().next().unwrap_or_default().chars().take(80).collect();
        Classification {
            intent: self.intent.clone(),
            autonomy_level: self.autonomy_level.clone(),
            summary,
            execution_prompt: text.to_string(),
            clarify_question: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_keeps_message_as_prompt() {
        let c = PassthroughClassifier::default()
            .classify("Book a table\nfor two at 7")
            .await;
        assert_eq!(c.intent, "general");
        assert_eq!(c.summary, "Book a table");
        assert_eq!(c.execution_prompt, "Book a table\nfor two at 7");
        assert!(c.clarify_question.is_none());
    }
}
