//! Chat adapter errors

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading a model or running a turn.
///
/// Each one is reported once through the session's event sink as a Status
/// event before it is returned.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChatError {
    #[error("One or more parameters were not specified: {0}")]
    Params(String),

    #[error("Unable to load model: {0}")]
    ModelLoad(String),

    #[error("Unusable chat template: {0}")]
    Template(String),

    #[error("Unable to tokenize prompt. Result={0}.")]
    Tokenize(i32),

    #[error("Unable to evaluate prompt. Result={0}.")]
    Eval(i32),

    #[error("Unable to decode token: {0}")]
    Decode(String),

    #[error("Unable to load media '{}': {reason}", path.display())]
    MediaLoad { path: PathBuf, reason: String },

    #[error("Unable to clear history: {0}")]
    History(String),

    #[error("Context length exceeded ({needed} positions needed, limit is {limit})")]
    ContextFull { needed: usize, limit: usize },

    #[error("A turn is already in progress")]
    Busy,

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl ChatError {
    /// Returns true if no usable session can exist after this error.
    ///
    /// The CLI exits with status 1 on these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChatError::Params(_) | ChatError::ModelLoad(_) | ChatError::Template(_)
        )
    }

    /// Returns true if the running context may be inconsistent after this error
    /// and should be cleared before the next turn.
    pub fn taints_context(&self) -> bool {
        matches!(
            self,
            ChatError::Eval(_) | ChatError::Decode(_) | ChatError::ContextFull { .. }
        )
    }

    /// Formats the message delivered through the Status event.
    pub fn status_message(&self, operation: &str) -> String {
        format!("{operation} | ERROR: {self}")
    }
}
