//! User records.

use crate::{timestamp_at, RepositoryError};
use chatline_types::{FriendProfile, SenderProfile, UserId, UserProfile};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// A registered user. The password hash never leaves the database layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub profile_image_url: String,
    pub created_at: NaiveDateTime,
}

impl User {
    /// Profile snippet embedded in delivery envelopes.
    pub fn sender_profile(&self) -> SenderProfile {
        SenderProfile {
            id: self.id,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            profile_image_url: self.profile_image_url.clone(),
        }
    }

    /// Account view returned by the user directory.
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            username: self.username.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
            profile_image_url: self.profile_image_url.clone(),
        }
    }

    /// Compact profile used in friend lists and search results.
    pub fn friend_profile(&self) -> FriendProfile {
        FriendProfile {
            id: self.id,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            profile_image_url: self.profile_image_url.clone(),
            username: self.username.clone(),
        }
    }
}

/// Parameters for creating a user. Hashing the password is the caller's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserParams {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub profile_image_url: String,
    pub password_hash: String,
}

/// Profile edits. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateUserParams {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

const USER_COLUMNS: &str =
    "id, username, first_name, last_name, email, profile_image_url, created_at";

/// Creates a user and returns the stored record.
///
/// # Errors
///
/// Returns `RepositoryError::Conflict` when the username or email is taken.
pub fn create_user(conn: &Connection, params: &CreateUserParams) -> Result<User, RepositoryError> {
    let sql = format!(
        "INSERT INTO users (username, first_name, last_name, email, profile_image_url, password)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         RETURNING {USER_COLUMNS}"
    );
    let user = conn.query_row(
        &sql,
        params![
            params.username,
            params.first_name,
            params.last_name,
            params.email,
            params.profile_image_url,
            params.password_hash,
        ],
        map_row_to_user,
    )
    .map_err(|e| {
        RepositoryError::from_write(e, || {
            format!("username {} or email {} is taken", params.username, params.email)
        })
    })?;
    tracing::debug!(user_id = user.id, username = %user.username, "user created");
    Ok(user)
}

/// Retrieves a user by id.
pub fn get_user(conn: &Connection, id: UserId) -> Result<User, RepositoryError> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        [id],
        map_row_to_user,
    )
    .optional()?
    .ok_or_else(|| RepositoryError::NotFound(format!("user {id}")))
}

/// Retrieves a user by username.
pub fn find_user_by_username(conn: &Connection, username: &str) -> Result<User, RepositoryError> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
        [username],
        map_row_to_user,
    )
    .optional()?
    .ok_or_else(|| RepositoryError::NotFound(format!("user {username}")))
}

/// All users, oldest account first.
pub fn list_users(conn: &Connection) -> Result<Vec<User>, RepositoryError> {
    let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))?;
    let users = stmt
        .query_map([], map_row_to_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

/// Directory search on behalf of `caller_username`, who is never in the
/// results.
///
/// A query starting with `@` matches usernames only; anything else matches
/// first name, last name or username. Matching is a case-insensitive
/// substring match. A blank query returns nothing.
pub fn search_users(
    conn: &Connection,
    caller_username: &str,
    query: &str,
) -> Result<Vec<User>, RepositoryError> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let (filter, needle) = match query.strip_prefix('@') {
        Some(handle) => ("username LIKE ?2 ESCAPE '\\'", handle),
        None => (
            "(first_name LIKE ?2 ESCAPE '\\' OR last_name LIKE ?2 ESCAPE '\\' \
             OR username LIKE ?2 ESCAPE '\\')",
            query,
        ),
    };
    let pattern = format!("%{}%", escape_like(needle));

    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS} FROM users
         WHERE username != ?1 AND {filter}
         ORDER BY username"
    ))?;
    let users = stmt
        .query_map(params![caller_username, pattern], map_row_to_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Applies `params` to user `id` and returns the updated record.
pub fn update_user(
    conn: &Connection,
    id: UserId,
    params: &UpdateUserParams,
) -> Result<User, RepositoryError> {
    conn.query_row(
        &format!(
            "UPDATE users SET
                first_name = COALESCE(?2, first_name),
                last_name = COALESCE(?3, last_name),
                profile_image_url = COALESCE(?4, profile_image_url),
                updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
             WHERE id = ?1
             RETURNING {USER_COLUMNS}"
        ),
        params![
            id,
            params.first_name,
            params.last_name,
            params.profile_image_url
        ],
        map_row_to_user,
    )
    .optional()?
    .ok_or_else(|| RepositoryError::NotFound(format!("user {id}")))
}

/// Deletes user `id`.
///
/// # Errors
///
/// `RepositoryError::Conflict` while messages still reference the user;
/// stored conversations are never orphaned.
pub fn delete_user(conn: &Connection, id: UserId) -> Result<(), RepositoryError> {
    let deleted = conn
        .execute("DELETE FROM users WHERE id = ?1", [id])
        .map_err(|e| RepositoryError::from_write(e, || format!("user {id} has messages")))?;
    if deleted == 0 {
        return Err(RepositoryError::NotFound(format!("user {id}")));
    }
    tracing::debug!(user_id = id, "user deleted");
    Ok(())
}

fn map_row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        email: row.get(4)?,
        profile_image_url: row.get(5)?,
        created_at: timestamp_at(row, 6)?,
    })
}
