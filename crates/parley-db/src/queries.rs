use crate::Database;
use crate::models::{AttachmentRow, ChatRow, LatestChatRow, ProfileRow, UserRow};
use anyhow::Result;
use rusqlite::{Connection, Row};

const CHAT_COLUMNS: &str =
    "m.id, m.sender_id, m.receiver_id, m.reply_to, m.chat_text, m.post_id, m.is_read, m.created_at";

impl Database {
    // -- Users --

    pub fn create_user(&self, user: &UserRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, full_name, email, password, profile_picture, verified, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    user.id,
                    user.username,
                    user.full_name,
                    user.email,
                    user.password,
                    user.profile_picture,
                    user.verified,
                    user.created_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    /// True when either the username or the email is already registered.
    pub fn user_exists(&self, username: &str, email: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE username = ?1 OR email = ?2",
                (username, email),
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Returns false when no user has that id.
    pub fn mark_verified(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("UPDATE users SET verified = 1 WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, full_name, profile_picture FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok(ProfileRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        full_name: row.get(2)?,
                        profile_picture: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    // -- Private messages --

    pub fn insert_chat(&self, chat: &ChatRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO private_messages (id, sender_id, receiver_id, reply_to, chat_text, post_id, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    chat.id,
                    chat.sender_id,
                    chat.receiver_id,
                    chat.reply_to,
                    chat.chat_text,
                    chat.post_id,
                    chat.is_read,
                    chat.created_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_chat_by_id(&self, id: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM private_messages m WHERE m.id = ?1", CHAT_COLUMNS);
            conn.query_row(&sql, [id], chat_from_row).optional()
        })
    }

    /// Both directions of the conversation, oldest first.
    pub fn get_chat_between(&self, a: &str, b: &str) -> Result<Vec<ChatRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM private_messages m
                 WHERE (m.sender_id = ?1 AND m.receiver_id = ?2)
                    OR (m.sender_id = ?2 AND m.receiver_id = ?1)
                 ORDER BY m.created_at ASC",
                CHAT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map((a, b), chat_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Newest message per conversation partner of `user`, newest conversation first.
    pub fn get_latest_chats(&self, user: &str) -> Result<Vec<LatestChatRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {}, u.id, u.username, u.full_name, u.profile_picture,
                        (SELECT COUNT(*) FROM private_messages x
                          WHERE x.sender_id = l.partner AND x.receiver_id = ?1 AND x.is_read = 0)
                 FROM (
                     SELECT CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END AS partner,
                            MAX(created_at) AS last_at
                     FROM private_messages
                     WHERE sender_id = ?1 OR receiver_id = ?1
                     GROUP BY partner
                 ) l
                 JOIN private_messages m
                   ON m.created_at = l.last_at
                  AND ((m.sender_id = ?1 AND m.receiver_id = l.partner)
                    OR (m.sender_id = l.partner AND m.receiver_id = ?1))
                 JOIN users u ON u.id = l.partner
                 GROUP BY l.partner
                 ORDER BY m.created_at DESC",
                CHAT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user], |row| {
                    Ok(LatestChatRow {
                        chat: chat_from_row(row)?,
                        partner: ProfileRow {
                            id: row.get(8)?,
                            username: row.get(9)?,
                            full_name: row.get(10)?,
                            profile_picture: row.get(11)?,
                        },
                        unread_count: row.get(12)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Deletes the message and its attachment rows, returning the stored
    /// file names so the caller can remove the files. `None` if absent.
    pub fn delete_chat(&self, id: &str) -> Result<Option<Vec<String>>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let files = {
                let mut stmt = tx.prepare(
                    "SELECT file_name FROM private_messages_attachment WHERE chat_id = ?1",
                )?;
                stmt.query_map([id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            let n = tx.execute("DELETE FROM private_messages WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok((n > 0).then_some(files))
        })
    }

    /// Marks every unread message from `partner` to `reader` as read.
    pub fn mark_read(&self, reader: &str, partner: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE private_messages SET is_read = 1
                 WHERE receiver_id = ?1 AND sender_id = ?2 AND is_read = 0",
                (reader, partner),
            )?;
            Ok(n)
        })
    }

    // -- Attachments --

    /// Inserts all rows or none.
    pub fn insert_attachments(&self, rows: &[AttachmentRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO private_messages_attachment (id, chat_id, file_name, media_type, size, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for a in rows {
                    stmt.execute(rusqlite::params![
                        a.id,
                        a.chat_id,
                        a.file_name,
                        a.media_type,
                        a.size,
                        a.created_at,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Batch-fetch attachments for a set of message ids.
    pub fn get_attachments_for_chats(&self, chat_ids: &[String]) -> Result<Vec<AttachmentRow>> {
        if chat_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=chat_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, chat_id, file_name, media_type, size, created_at
                 FROM private_messages_attachment
                 WHERE chat_id IN ({})
                 ORDER BY created_at ASC",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(chat_ids.iter()), |row| {
                    Ok(AttachmentRow {
                        id: row.get(0)?,
                        chat_id: row.get(1)?,
                        file_name: row.get(2)?,
                        media_type: row.get(3)?,
                        size: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, username, full_name, email, password, profile_picture, verified, created_at
         FROM users WHERE {} = ?1",
        column
    );
    conn.query_row(&sql, [value], |row| {
        Ok(UserRow {
            id: row.get(0)?,
            username: row.get(1)?,
            full_name: row.get(2)?,
            email: row.get(3)?,
            password: row.get(4)?,
            profile_picture: row.get(5)?,
            verified: row.get(6)?,
            created_at: row.get(7)?,
        })
    })
    .optional()
}

fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<ChatRow> {
    Ok(ChatRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        reply_to: row.get(3)?,
        chat_text: row.get(4)?,
        post_id: row.get(5)?,
        is_read: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
