//! Direct messages between two users.

use crate::{timestamp_at, RepositoryError};
use chatline_types::{
    envelope_time, history_time, DeliveryEnvelope, FriendProfile, FriendSummary, HistoryEntry,
    LastMessage, MessageId, SenderProfile, UserId, LAST_SEEN_PLACEHOLDER,
};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// A stored direct message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// A stored message joined with its sender's profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageWithSender {
    pub message: Message,
    pub sender: SenderProfile,
}

impl MessageWithSender {
    /// Projects the message into the envelope pushed to a live connection.
    pub fn envelope(&self, is_self: bool) -> DeliveryEnvelope {
        DeliveryEnvelope {
            id: self.message.id,
            is_self,
            is_read: false,
            message: self.message.content.clone(),
            time: envelope_time(&self.message.created_at),
            receiver_id: self.message.receiver_id,
            sender: self.sender.clone(),
        }
    }
}

/// Parameters for creating a new message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMessageParams {
    pub content: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
}

const MESSAGE_COLUMNS: &str = "id, content, sender_id, receiver_id, created_at, updated_at";

/// Persists a message and returns it together with the sender's profile.
///
/// Both users must exist; an unknown sender or receiver fails the foreign
/// key check and surfaces as `RepositoryError::Database`.
pub fn create_message(
    conn: &Connection,
    params: &CreateMessageParams,
) -> Result<MessageWithSender, RepositoryError> {
    let id: MessageId = conn.query_row(
        "INSERT INTO messages (content, sender_id, receiver_id) VALUES (?1, ?2, ?3) RETURNING id",
        params![params.content, params.sender_id, params.receiver_id],
        |row| row.get(0),
    )?;

    get_message_with_sender(conn, id)
}

/// Retrieves a message by id.
pub fn get_message(conn: &Connection, id: MessageId) -> Result<Message, RepositoryError> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        [id],
        map_row_to_message,
    )
    .optional()?
    .ok_or_else(|| RepositoryError::NotFound(format!("message {id}")))
}

/// Retrieves a message by id, joined with its sender's profile.
pub fn get_message_with_sender(
    conn: &Connection,
    id: MessageId,
) -> Result<MessageWithSender, RepositoryError> {
    conn.query_row(
        "SELECT m.id, m.content, m.sender_id, m.receiver_id, m.created_at, m.updated_at,
                u.first_name, u.last_name, u.profile_image_url
         FROM messages m
         INNER JOIN users u ON u.id = m.sender_id
         WHERE m.id = ?1",
        [id],
        |row| {
            let message = map_row_to_message(row)?;
            let sender = SenderProfile {
                id: message.sender_id,
                first_name: row.get(6)?,
                last_name: row.get(7)?,
                profile_image_url: row.get(8)?,
            };
            Ok(MessageWithSender { message, sender })
        },
    )
    .optional()?
    .ok_or_else(|| RepositoryError::NotFound(format!("message {id}")))
}

/// Replaces a message's content and bumps `updated_at`.
pub fn update_message_content(
    conn: &Connection,
    id: MessageId,
    content: &str,
) -> Result<Message, RepositoryError> {
    conn.query_row(
        &format!(
            "UPDATE messages
             SET content = ?1, updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
             WHERE id = ?2
             RETURNING {MESSAGE_COLUMNS}"
        ),
        params![content, id],
        map_row_to_message,
    )
    .optional()?
    .ok_or_else(|| RepositoryError::NotFound(format!("message {id}")))
}

/// Deletes a message.
pub fn delete_message(conn: &Connection, id: MessageId) -> Result<(), RepositoryError> {
    let count = conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
    if count == 0 {
        return Err(RepositoryError::NotFound(format!("message {id}")));
    }
    Ok(())
}

/// Lists every message exchanged between two users, in either direction,
/// most recent first.
pub fn list_messages_between(
    conn: &Connection,
    user_id: UserId,
    peer_id: UserId,
) -> Result<Vec<Message>, RepositoryError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM messages
         WHERE (sender_id = ?1 AND receiver_id = ?2)
            OR (sender_id = ?2 AND receiver_id = ?1)
         ORDER BY created_at DESC, id DESC"
    ))?;

    let rows = stmt.query_map(params![user_id, peer_id], map_row_to_message)?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

/// Conversation history between `user_id` and `peer_id` as seen by
/// `user_id`, most recent first.
pub fn list_history(
    conn: &Connection,
    user_id: UserId,
    peer_id: UserId,
) -> Result<Vec<HistoryEntry>, RepositoryError> {
    let entries = list_messages_between(conn, user_id, peer_id)?
        .into_iter()
        .map(|m| HistoryEntry {
            id: m.id,
            is_self: m.sender_id == user_id,
            is_read: true,
            message: m.content,
            time: history_time(&m.created_at),
        })
        .collect();
    Ok(entries)
}

/// One row per conversation partner of `user_id`, carrying the latest message
/// of that conversation. Newest conversations come first.
pub fn list_friends_with_last_message(
    conn: &Connection,
    user_id: UserId,
) -> Result<Vec<FriendSummary>, RepositoryError> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.first_name, u.last_name, u.profile_image_url, u.username,
                m.content, m.created_at
         FROM messages m
         INNER JOIN (
             SELECT MAX(id) AS id
             FROM messages
             WHERE sender_id = ?1 OR receiver_id = ?1
             GROUP BY MIN(sender_id, receiver_id), MAX(sender_id, receiver_id)
         ) latest ON m.id = latest.id
         INNER JOIN users u
             ON u.id = CASE WHEN m.sender_id = ?1 THEN m.receiver_id ELSE m.sender_id END
         WHERE u.id != ?1
         ORDER BY m.id DESC",
    )?;

    let rows = stmt.query_map([user_id], |row| {
        let sent_at = timestamp_at(row, 6)?;
        Ok(FriendSummary {
            profile: FriendProfile {
                id: row.get(0)?,
                first_name: row.get(1)?,
                last_name: row.get(2)?,
                profile_image_url: row.get(3)?,
                username: row.get(4)?,
            },
            last_seen: LAST_SEEN_PLACEHOLDER.to_string(),
            unread_count: 0,
            last_message: LastMessage {
                content: row.get(5)?,
                time: envelope_time(&sent_at),
            },
        })
    })?;

    let mut friends = Vec::new();
    for row in rows {
        friends.push(row?);
    }
    Ok(friends)
}

fn map_row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        content: row.get(1)?,
        sender_id: row.get(2)?,
        receiver_id: row.get(3)?,
        created_at: timestamp_at(row, 4)?,
        updated_at: timestamp_at(row, 5)?,
    })
}
