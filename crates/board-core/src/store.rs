//! The message store contract.

use async_trait::async_trait;
use board_protocol::{Message, MessageId};
use thiserror::Error;

/// Default maximum message length, in characters.
pub const DEFAULT_MAX_TEXT_LENGTH: usize = 2000;

/// Rejected message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Text is empty or only whitespace.
    #[error("Message text is empty")]
    Empty,

    /// Text exceeds the configured length.
    #[error("Message text is {len} characters, maximum is {max}")]
    TooLong { len: usize, max: usize },
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The message text was rejected.
    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// The underlying database failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The store could not run the operation at all.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether this error comes from the storage medium rather than the input.
    #[must_use]
    pub fn is_storage(&self) -> bool {
        !matches!(self, StoreError::Validation(_))
    }
}

/// Validate message text, returning it trimmed.
///
/// # Errors
///
/// Returns an error if the trimmed text is empty or longer than `max_len`
/// characters.
pub fn validate_text(text: &str, max_len: usize) -> Result<&str, ValidationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }

    let len = trimmed.chars().count();
    if len > max_len {
        return Err(ValidationError::TooLong { len, max: max_len });
    }

    Ok(trimmed)
}

/// A durable log of board messages.
///
/// Implementations serialize all operations against each other: no two
/// inserts receive the same id and a listing never observes a half-written
/// row. Every write is committed before the call returns.
#[async_trait]
pub trait Store: Send + Sync {
    /// Validate and persist a new message, assigning its id and timestamp.
    async fn insert(&self, text: &str) -> Result<Message, StoreError>;

    /// Remove a message. Missing ids are not an error.
    ///
    /// Returns `true` if a row was removed.
    async fn delete(&self, id: MessageId) -> Result<bool, StoreError>;

    /// All surviving messages in ascending id order.
    async fn list_all(&self) -> Result<Vec<Message>, StoreError>;
}
