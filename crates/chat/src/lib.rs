use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest auto-derived conversation title, in characters.
const TITLE_PREVIEW_CHARS: usize = 48;

/// Repository trait for conversation persistence.
/// Implemented by the storage layer, allowing the domain to remain decoupled.
pub trait ConversationRepository: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn save(&self, conversation: &Conversation) -> Result<(), Self::Error>;
    fn get(&self, id: &Uuid) -> Result<Conversation, Self::Error>;
    fn list(&self) -> Result<Vec<Conversation>, Self::Error>;
    fn delete(&self, id: &Uuid) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Assistant,
}

/// One message of a conversation.
///
/// Display strings for the hour and day are derived from `created_at` on
/// demand, never stored, so they cannot drift from the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    pub sender: Sender,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn from_user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: Sender::User,
            created_at: Utc::now(),
        }
    }

    pub fn from_assistant(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: Sender::Assistant,
            created_at: Utc::now(),
        }
    }

    pub fn is_from_user(&self) -> bool {
        self.sender == Sender::User
    }

    /// "14:05"-style label in the given zone.
    pub fn hour_label<Tz: TimeZone>(&self, tz: &Tz) -> String
    where
        Tz::Offset: std::fmt::Display,
    {
        self.created_at.with_timezone(tz).format("%H:%M").to_string()
    }

    /// "25 August"-style label in the given zone.
    pub fn day_label<Tz: TimeZone>(&self, tz: &Tz) -> String
    where
        Tz::Offset: std::fmt::Display,
    {
        self.created_at.with_timezone(tz).format("%-d %B").to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message. The first user message also becomes the title.
    pub fn push(&mut self, message: ChatMessage) {
        if self.title.is_none() && message.sender == Sender::User {
            self.title = Some(preview(&message.text));
        }
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

fn preview(text: &str) -> String {
    let trimmed = text.trim();
    let mut out: String = trimmed.chars().take(TITLE_PREVIEW_CHARS).collect();
    if trimmed.chars().count() > TITLE_PREVIEW_CHARS {
        out.push('…');
    }
    out
}
