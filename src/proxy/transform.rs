//! Message flattening: an OpenAI message list becomes the single prompt
//! string the chat engine answers.
//!
//! The rendered text is user visible, so the layout must stay stable:
//!
//! ```text
//! System Instructions:
//! <system lines>
//!
//! Conversation History:
//! <role: content lines>
//!
//! Current User Question:
//! <last user message>
//! ```

use crate::models::openai::ChatMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenedConversation {
    pub system: Vec<String>,
    pub history: Vec<String>,
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlattenError {
    #[error("no user message found")]
    NoUserMessage,
}

/// Walk `messages` in order and split them into system lines, history lines
/// and the current question.
///
/// Messages without text are skipped. A user message enters the history
/// unless it is the last element of the array.
pub fn flatten_messages(messages: &[ChatMessage]) -> Result<FlattenedConversation, FlattenError> {
    let last_index = messages.len().saturating_sub(1);
    let mut system = Vec::new();
    let mut history = Vec::new();
    let mut question: Option<String> = None;

    for (i, msg) in messages.iter().enumerate() {
        let content = msg.text();
        if content.is_empty() {
            continue;
        }
        match msg.role.trim().to_lowercase().as_str() {
            "system" => system.push(content),
            "user" => {
                if i != last_index {
                    history.push(format!("user: {}", content));
                }
                question = Some(content);
            }
            _ => history.push(format!("{}: {}", msg.role, content)),
        }
    }

    let question = question.ok_or(FlattenError::NoUserMessage)?;
    Ok(FlattenedConversation {
        system,
        history,
        question,
    })
}

impl FlattenedConversation {
    pub fn render(&self) -> String {
        let mut prompt = String::new();
        if !self.system.is_empty() {
            prompt.push_str("System Instructions:\n");
            prompt.push_str(&self.system.join("\n"));
            prompt.push_str("\n\n");
        }
        if !self.history.is_empty() {
            prompt.push_str("Conversation History:\n");
            prompt.push_str(&self.history.join("\n"));
            prompt.push_str("\n\n");
        }
        prompt.push_str("Current User Question:\n");
        prompt.push_str(&self.question);
        prompt
    }
}
