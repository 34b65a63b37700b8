//! Users and direct messages for Chatline.
//!
//! Implements the persistence side of the chat: user records, one-to-one
//! message storage, conversation history and the friend list with each
//! partner's latest message. Functions take a `rusqlite::Connection` and are
//! meant to run inside `spawn_blocking`; [`MessageStore`] wraps them behind a
//! pool for the real-time router.

mod messages;
mod store;
mod users;

use chrono::NaiveDateTime;
use rusqlite::Row;
use thiserror::Error;

pub use messages::{
    create_message, delete_message, get_message, get_message_with_sender,
    list_friends_with_last_message, list_history, list_messages_between, update_message_content,
    CreateMessageParams, Message, MessageWithSender,
};
pub use store::{MessageStore, PooledMessageStore, StoreError};
pub use users::{
    create_user, delete_user, find_user_by_username, get_user, list_users, search_users,
    update_user, CreateUserParams, UpdateUserParams, User,
};

/// Errors that can occur during user and message operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    /// A uniqueness or reference constraint blocked the write.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl RepositoryError {
    /// Maps constraint violations to `Conflict`; anything else stays a
    /// database error.
    fn from_write(e: rusqlite::Error, what: impl FnOnce() -> String) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => Self::Conflict(what()),
            _ => Self::Database(e),
        }
    }
}

/// Storage format of `created_at` / `updated_at` columns.
const STORED_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Reads a stored timestamp column.
fn timestamp_at(row: &Row, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&raw, STORED_TIME_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
