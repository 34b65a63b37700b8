//! In-memory directory of live connections, keyed by user identity.

use chatline_types::UserId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use uuid::Uuid;

/// Returned by [`ConnectionHandle::push`]; the frame was dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    /// The outbound queue is at capacity; the writer is not keeping up.
    #[error("outbound queue of connection {session_id} is full")]
    Full { session_id: Uuid },
    /// The connection's writer is gone.
    #[error("connection {session_id} is closed")]
    Closed { session_id: Uuid },
}

/// Sending half of one live connection.
///
/// Cloning is cheap; every clone talks to the same writer task. A handle is
/// closed by [`ConnectionHandle::close`], which tells the writer to send a
/// close frame and stop.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    session_id: Uuid,
    tx: mpsc::Sender<String>,
    closed: Arc<Notify>,
}

/// Receiving half of a connection, owned by the writer task.
#[derive(Debug)]
pub struct Outbox {
    pub rx: mpsc::Receiver<String>,
    pub closed: Arc<Notify>,
}

impl ConnectionHandle {
    /// Creates a handle with a fresh session id and a queue of `capacity`
    /// outbound frames.
    pub fn new(capacity: usize) -> (Self, Outbox) {
        let (tx, rx) = mpsc::channel(capacity);
        let closed = Arc::new(Notify::new());
        let handle = Self {
            session_id: Uuid::new_v4(),
            tx,
            closed: closed.clone(),
        };
        (handle, Outbox { rx, closed })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Queues a serialized frame for the writer without waiting. A full
    /// queue drops the frame.
    pub fn push(&self, frame: String) -> Result<(), PushError> {
        let session_id = self.session_id;
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => PushError::Full { session_id },
            TrySendError::Closed(_) => PushError::Closed { session_id },
        })
    }

    /// Asks the writer to close the transport. Idempotent.
    pub fn close(&self) {
        self.closed.notify_one();
    }
}

/// Process-wide map from user id to that user's live connection.
///
/// Every operation takes the same mutex; it is never held across an
/// `.await`, so a `std::sync::Mutex` is used.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<Mutex<HashMap<UserId, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<UserId, ConnectionHandle>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // Single-step map operations; the data is still consistent.
                tracing::error!("connection registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Binds `user_id` to `handle`, replacing any previous connection.
    ///
    /// A replaced handle is closed so its session tears down instead of
    /// lingering unreachable. Returns the replaced handle, if any.
    pub fn register(&self, user_id: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let session_id = handle.session_id;
        let previous = self.entries().insert(user_id, handle);

        if let Some(stale) = &previous {
            if stale.session_id != session_id {
                stale.close();
                tracing::info!(
                    user_id,
                    stale_session_id = %stale.session_id,
                    session_id = %session_id,
                    "replaced existing connection; closing the stale one"
                );
            }
        }
        previous
    }

    /// Returns the live connection for `user_id`, if the user is online.
    pub fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.entries().get(&user_id).cloned()
    }

    /// Removes whatever connection `user_id` has. No-op when absent.
    pub fn unregister(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.entries().remove(&user_id)
    }

    /// Removes the entry for `user_id` only if it still belongs to
    /// `session_id`. Returns whether an entry was removed.
    ///
    /// Sessions tear down through this so that a connection replaced by a
    /// newer one cannot evict its successor.
    pub fn unregister_session(&self, user_id: UserId, session_id: Uuid) -> bool {
        let mut entries = self.entries();
        match entries.get(&user_id) {
            Some(current) if current.session_id == session_id => {
                entries.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Number of users currently connected.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
