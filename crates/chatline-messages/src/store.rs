//! Pool-backed message store used by the real-time path.

use crate::{create_message, CreateMessageParams, MessageWithSender, RepositoryError};
use chatline_db::DbPool;
use thiserror::Error;

/// Errors surfaced by a [`MessageStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to get database connection: {0}")]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Durable storage for messages produced by live connections.
///
/// Calls are blocking; async callers run them on the blocking thread pool.
pub trait MessageStore: Send + Sync + 'static {
    /// Persists a message and returns it with the sender's profile attached.
    fn create_message(&self, params: &CreateMessageParams) -> Result<MessageWithSender, StoreError>;
}

/// [`MessageStore`] over the shared SQLite pool.
#[derive(Clone)]
pub struct PooledMessageStore {
    pool: DbPool,
}

impl PooledMessageStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl MessageStore for PooledMessageStore {
    fn create_message(&self, params: &CreateMessageParams) -> Result<MessageWithSender, StoreError> {
        let conn = self.pool.get()?;
        Ok(create_message(&conn, params)?)
    }
}
