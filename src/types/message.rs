//! Message types
//!
//! Defines the chat message handed to the chat template for one turn.

use std::fmt;

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Message from the user
    User,
    /// Message from the AI assistant
    Assistant,
    /// System prompt
    System,
}

impl Role {
    /// Role name as chat templates expect it
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single chat message, rendered through the chat template one turn at a time.
///
/// The content may contain media markers, one per media item queued for the turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// The role of the message sender
    pub role: Role,
    /// The content of the message
    pub content: String,
}

impl ChatMessage {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Shorthand for a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}
