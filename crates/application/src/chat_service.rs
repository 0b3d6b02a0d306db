//! Chat orchestration between the conversation store and the engine.
//!
//! Generation is CPU-bound and runs on a blocking thread; decoded text
//! crosses back to the async side through a channel.

use std::sync::Arc;

use banter_chat::{Conversation, Sender};
use banter_genai::{ChatEngine, ChatTurn, GenerateOptions};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum ChatServiceError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("generation failed: {0}")]
    Generation(String),
}

/// Stateless helpers for producing an assistant reply.
pub struct ChatService;

impl ChatService {
    /// Reject empty or whitespace-only input before it reaches the engine.
    pub fn validate_input(text: &str) -> Result<&str, ChatServiceError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ChatServiceError::EmptyMessage);
        }
        Ok(trimmed)
    }

    /// Turn list handed to the engine: system prompt first, then the
    /// conversation in order.
    pub fn build_turns(system_prompt: &str, conversation: &Conversation) -> Vec<ChatTurn> {
        let mut turns = Vec::with_capacity(conversation.len() + 1);
        if !system_prompt.trim().is_empty() {
            turns.push(ChatTurn::system(system_prompt));
        }
        for message in &conversation.messages {
            turns.push(match message.sender {
                Sender::User => ChatTurn::user(message.text.as_str()),
                Sender::Assistant => ChatTurn::assistant(message.text.as_str()),
            });
        }
        turns
    }

    /// Generate a reply on a blocking thread, streaming decoded text through
    /// `tokens` as it is produced. Returns the full reply text.
    pub async fn reply(
        engine: Arc<dyn ChatEngine>,
        system_prompt: &str,
        conversation: &Conversation,
        options: GenerateOptions,
        tokens: mpsc::UnboundedSender<String>,
    ) -> Result<String, ChatServiceError> {
        let turns = Self::build_turns(system_prompt, conversation);

        let result = tokio::task::spawn_blocking(move || {
            let mut emit = |piece: &str| {
                let _ = tokens.send(piece.to_string());
            };
            engine.generate(&turns, &options, &mut emit)
        })
        .await;

        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(ChatServiceError::Generation(e.to_string())),
            Err(e) => Err(ChatServiceError::Generation(e.to_string())),
        }
    }
}
