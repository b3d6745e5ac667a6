use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::Database;
use crate::error::StoreError;
use crate::models::{MessageRow, NotificationRow, ThreadRow, UserRow};

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        password_hash: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn get_username_by_id(&self, id: &str) -> Result<String, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT username FROM users WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or(StoreError::NotFound("user"))
        })
    }

    // -- Threads --

    /// Get-or-create the direct thread between two users. The pair is
    /// canonicalized to (min, max) and upserted against the UNIQUE pair
    /// constraint, so both orderings and concurrent first-contact resolve
    /// to the same row.
    pub fn open_thread(&self, user_a: &str, user_b: &str) -> Result<ThreadRow, StoreError> {
        if user_a == user_b {
            return Err(StoreError::validation("cannot open a thread with yourself"));
        }
        let (lo, hi) = if user_a <= user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };

        let candidate_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        self.with_conn(|conn| {
            for user in [lo, hi] {
                if query_user(conn, "id", user)?.is_none() {
                    return Err(StoreError::NotFound("user"));
                }
            }

            // Discarded when the pair already exists; the select below
            // returns whichever insert won.
            conn.execute(
                "INSERT INTO threads (id, participant_lo, participant_hi, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(participant_lo, participant_hi) DO NOTHING",
                params![candidate_id, lo, hi, now],
            )?;

            query_thread_by_pair(conn, lo, hi)?.ok_or(StoreError::NotFound("thread"))
        })
    }

    pub fn get_thread(&self, id: &str) -> Result<Option<ThreadRow>, StoreError> {
        self.with_conn(|conn| query_thread_by_id(conn, id))
    }

    // -- Messages --

    /// The single authoritative persistence path for chat messages, used by
    /// both the HTTP handlers and the WebSocket relay. In one transaction:
    /// advance the thread's sequence counter, insert the message with the
    /// new seq, and move the last-message pointer. Callers broadcast only
    /// after this returns Ok.
    pub fn create_message(
        &self,
        id: &str,
        thread_id: &str,
        sender_id: &str,
        body: &str,
        attachments: &[String],
    ) -> Result<MessageRow, StoreError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(StoreError::validation("message body must not be empty"));
        }
        let attachments_json =
            serde_json::to_string(attachments).map_err(|e| StoreError::validation(e.to_string()))?;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = Utc::now().to_rfc3339();

            let updated = tx.execute(
                "UPDATE threads SET last_seq = last_seq + 1, updated_at = ?2 WHERE id = ?1",
                params![thread_id, now],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound("thread"));
            }

            let seq: i64 = tx.query_row(
                "SELECT last_seq FROM threads WHERE id = ?1",
                [thread_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO messages (id, thread_id, sender_id, seq, body, attachments, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id, thread_id, sender_id, seq, body, attachments_json, now],
            )?;

            tx.execute(
                "UPDATE threads SET last_message_id = ?2, last_message_at = ?3 WHERE id = ?1",
                params![thread_id, id, now],
            )?;

            tx.commit()?;

            Ok(MessageRow {
                id: id.to_string(),
                thread_id: thread_id.to_string(),
                sender_id: sender_id.to_string(),
                seq,
                body: body.to_string(),
                attachments: attachments_json,
                created_at: now,
            })
        })
    }

    /// All messages for a thread in seq order (= creation order).
    pub fn list_messages(&self, thread_id: &str) -> Result<Vec<MessageRow>, StoreError> {
        self.with_conn(|conn| {
            if query_thread_by_id(conn, thread_id)?.is_none() {
                return Err(StoreError::NotFound("thread"));
            }

            let mut stmt = conn.prepare(
                "SELECT id, thread_id, sender_id, seq, body, attachments, created_at
                 FROM messages
                 WHERE thread_id = ?1
                 ORDER BY seq ASC",
            )?;

            let rows = stmt
                .query_map([thread_id], map_message_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// The thread's denormalized last-message pointer, None until the first
    /// message lands.
    pub fn last_message(&self, thread_id: &str) -> Result<Option<(String, String)>, StoreError> {
        self.with_conn(|conn| {
            let row = query_thread_by_id(conn, thread_id)?.ok_or(StoreError::NotFound("thread"))?;
            Ok(match (row.last_message_id, row.last_message_at) {
                (Some(id), Some(at)) => Some((id, at)),
                _ => None,
            })
        })
    }

    // -- Notifications --

    pub fn create_notification(
        &self,
        id: &str,
        user_id: &str,
        message: &str,
        category: &str,
    ) -> Result<NotificationRow, StoreError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(StoreError::validation(
                "notification message must not be empty",
            ));
        }

        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, user_id, message, category, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'unread', ?5)",
                params![id, user_id, message, category, now],
            )?;

            Ok(NotificationRow {
                id: id.to_string(),
                user_id: user_id.to_string(),
                message: message.to_string(),
                category: category.to_string(),
                status: "unread".to_string(),
                created_at: now,
            })
        })
    }

    pub fn list_notifications(&self, user_id: &str) -> Result<Vec<NotificationRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, message, category, status, created_at
                 FROM notifications
                 WHERE user_id = ?1
                 ORDER BY created_at DESC",
            )?;

            let rows = stmt
                .query_map([user_id], map_notification_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Mark a notification read. Matching by id AND owner is the
    /// correctness-critical check: another user's id never resolves.
    /// Idempotent on already-read rows.
    pub fn mark_notification_read(
        &self,
        user_id: &str,
        notification_id: &str,
    ) -> Result<NotificationRow, StoreError> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE notifications SET status = 'read' WHERE id = ?1 AND user_id = ?2",
                params![notification_id, user_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound("notification"));
            }

            conn.query_row(
                "SELECT id, user_id, message, category, status, created_at
                 FROM notifications WHERE id = ?1",
                [notification_id],
                map_notification_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound("notification"))
        })
    }

    /// Delete a notification, same ownership rule as mark-read.
    pub fn delete_notification(
        &self,
        user_id: &str,
        notification_id: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM notifications WHERE id = ?1 AND user_id = ?2",
                params![notification_id, user_id],
            )?;
            if deleted == 0 {
                return Err(StoreError::NotFound("notification"));
            }
            Ok(())
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>, StoreError> {
    // column is one of the two fixed names below, never caller input
    let sql = format!(
        "SELECT id, username, password, created_at FROM users WHERE {} = ?1",
        column
    );
    let row = conn
        .query_row(&sql, [value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

const THREAD_COLUMNS: &str = "id, participant_lo, participant_hi, last_seq, \
     last_message_id, last_message_at, created_at, updated_at";

fn query_thread_by_id(conn: &Connection, id: &str) -> Result<Option<ThreadRow>, StoreError> {
    let sql = format!("SELECT {} FROM threads WHERE id = ?1", THREAD_COLUMNS);
    let row = conn.query_row(&sql, [id], map_thread_row).optional()?;
    Ok(row)
}

fn query_thread_by_pair(
    conn: &Connection,
    lo: &str,
    hi: &str,
) -> Result<Option<ThreadRow>, StoreError> {
    let sql = format!(
        "SELECT {} FROM threads WHERE participant_lo = ?1 AND participant_hi = ?2",
        THREAD_COLUMNS
    );
    let row = conn
        .query_row(&sql, [lo, hi], map_thread_row)
        .optional()?;
    Ok(row)
}

fn map_thread_row(row: &rusqlite::Row<'_>) -> Result<ThreadRow, rusqlite::Error> {
    Ok(ThreadRow {
        id: row.get(0)?,
        participant_lo: row.get(1)?,
        participant_hi: row.get(2)?,
        last_seq: row.get(3)?,
        last_message_id: row.get(4)?,
        last_message_at: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn map_message_row(row: &rusqlite::Row<'_>) -> Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        sender_id: row.get(2)?,
        seq: row.get(3)?,
        body: row.get(4)?,
        attachments: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn map_notification_row(row: &rusqlite::Row<'_>) -> Result<NotificationRow, rusqlite::Error> {
    Ok(NotificationRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        message: row.get(2)?,
        category: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::parse_timestamp;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        for (id, name) in [("u-alice", "alice"), ("u-bob", "bob"), ("u-carol", "carol")] {
            db.create_user(id, name, "argon2-hash").unwrap();
        }
        db
    }

    #[test]
    fn thread_pair_is_order_independent() {
        let db = test_db();
        let ab = db.open_thread("u-alice", "u-bob").unwrap();
        let ba = db.open_thread("u-bob", "u-alice").unwrap();
        assert_eq!(ab.id, ba.id);
    }

    #[test]
    fn open_thread_rejects_self_and_unknown_users() {
        let db = test_db();
        assert!(matches!(
            db.open_thread("u-alice", "u-alice"),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            db.open_thread("u-alice", "u-nobody"),
            Err(StoreError::NotFound("user"))
        ));
    }

    #[test]
    fn concurrent_open_thread_yields_single_row() {
        let db = Arc::new(test_db());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                std::thread::spawn(move || {
                    // alternate orderings to exercise canonicalization too
                    if i % 2 == 0 {
                        db.open_thread("u-alice", "u-bob").unwrap().id
                    } else {
                        db.open_thread("u-bob", "u-alice").unwrap().id
                    }
                })
            })
            .collect();

        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn
                    .query_row("SELECT COUNT(*) FROM threads", [], |row| row.get(0))
                    .unwrap())
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn empty_body_is_rejected_and_not_persisted() {
        let db = test_db();
        let thread = db.open_thread("u-alice", "u-bob").unwrap();

        let result = db.create_message("m-1", &thread.id, "u-alice", "   ", &[]);
        assert!(matches!(result, Err(StoreError::Validation(_))));

        assert!(db.list_messages(&thread.id).unwrap().is_empty());
        assert!(db.last_message(&thread.id).unwrap().is_none());
    }

    #[test]
    fn send_to_unknown_thread_is_not_found() {
        let db = test_db();
        let result = db.create_message("m-1", "t-missing", "u-alice", "hello", &[]);
        assert!(matches!(result, Err(StoreError::NotFound("thread"))));
    }

    #[test]
    fn last_message_pointer_tracks_latest_send() {
        let db = test_db();
        let thread = db.open_thread("u-alice", "u-bob").unwrap();
        assert!(db.last_message(&thread.id).unwrap().is_none());

        let first = db
            .create_message("m-1", &thread.id, "u-alice", "hello", &[])
            .unwrap();
        let (last_id, last_at) = db.last_message(&thread.id).unwrap().unwrap();
        assert_eq!(last_id, first.id);
        assert!(parse_timestamp(&last_at) >= parse_timestamp(&first.created_at));

        let second = db
            .create_message("m-2", &thread.id, "u-bob", "hi back", &[])
            .unwrap();
        let (last_id, _) = db.last_message(&thread.id).unwrap().unwrap();
        assert_eq!(last_id, second.id);
    }

    #[test]
    fn history_is_seq_ordered_and_grows_by_one() {
        let db = test_db();
        let thread = db.open_thread("u-alice", "u-bob").unwrap();

        for (i, body) in ["one", "two", "three"].iter().enumerate() {
            let id = format!("m-{}", i);
            let before = db.list_messages(&thread.id).unwrap().len();
            db.create_message(&id, &thread.id, "u-alice", body, &[])
                .unwrap();
            let after = db.list_messages(&thread.id).unwrap();
            assert_eq!(after.len(), before + 1);
        }

        let messages = db.list_messages(&thread.id).unwrap();
        let seqs: Vec<i64> = messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(
            messages
                .windows(2)
                .all(|w| parse_timestamp(&w[0].created_at) <= parse_timestamp(&w[1].created_at))
        );
    }

    #[test]
    fn attachments_round_trip_through_storage() {
        let db = test_db();
        let thread = db.open_thread("u-alice", "u-bob").unwrap();

        let refs = vec!["upload/1.png".to_string(), "upload/2.png".to_string()];
        db.create_message("m-1", &thread.id, "u-alice", "look", &refs)
            .unwrap();

        let stored = &db.list_messages(&thread.id).unwrap()[0];
        assert_eq!(stored.attachments_vec(), refs);
    }

    #[test]
    fn direct_chat_end_to_end() {
        let db = test_db();

        let thread = db.open_thread("u-alice", "u-bob").unwrap();
        assert!(thread.last_message_id.is_none());

        let message = db
            .create_message("m-hello", &thread.id, "u-alice", "hello", &[])
            .unwrap();

        let (last_id, _) = db.last_message(&thread.id).unwrap().unwrap();
        assert_eq!(last_id, message.id);

        let history = db.list_messages(&thread.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "hello");
    }

    #[test]
    fn mark_read_enforces_ownership_and_is_idempotent() {
        let db = test_db();
        let n = db
            .create_notification("n-1", "u-alice", "Item added to your cart", "cart")
            .unwrap();
        assert_eq!(n.status, "unread");

        // another user cannot flip it
        let result = db.mark_notification_read("u-bob", "n-1");
        assert!(matches!(result, Err(StoreError::NotFound("notification"))));
        let listed = db.list_notifications("u-alice").unwrap();
        assert_eq!(listed[0].status, "unread");

        // owner can, and a second call is a no-op success
        let read = db.mark_notification_read("u-alice", "n-1").unwrap();
        assert_eq!(read.status, "read");
        let again = db.mark_notification_read("u-alice", "n-1").unwrap();
        assert_eq!(again.status, "read");
    }

    #[test]
    fn delete_enforces_ownership() {
        let db = test_db();
        db.create_notification("n-1", "u-alice", "Welcome to souk", "authentication")
            .unwrap();

        assert!(matches!(
            db.delete_notification("u-bob", "n-1"),
            Err(StoreError::NotFound("notification"))
        ));
        assert_eq!(db.list_notifications("u-alice").unwrap().len(), 1);

        db.delete_notification("u-alice", "n-1").unwrap();
        assert!(db.list_notifications("u-alice").unwrap().is_empty());
    }

    #[test]
    fn notifications_list_newest_first() {
        let db = test_db();
        db.create_notification("n-1", "u-alice", "first", "cart")
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        db.create_notification("n-2", "u-alice", "second", "order")
            .unwrap();

        let listed = db.list_notifications("u-alice").unwrap();
        assert_eq!(listed.len(), 2);
        assert!(
            parse_timestamp(&listed[0].created_at) >= parse_timestamp(&listed[1].created_at)
        );
        assert_eq!(listed[0].id, "n-2");

        // empty message is rejected
        assert!(matches!(
            db.create_notification("n-3", "u-alice", "  ", "cart"),
            Err(StoreError::Validation(_))
        ));
    }
}
