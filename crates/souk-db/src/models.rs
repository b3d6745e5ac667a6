//! Database row types — these map directly to SQLite rows.
//! Distinct from souk-types API models to keep the DB layer independent.

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct ThreadRow {
    pub id: String,
    pub participant_lo: String,
    pub participant_hi: String,
    pub last_seq: i64,
    pub last_message_id: Option<String>,
    pub last_message_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub thread_id: String,
    pub sender_id: String,
    pub seq: i64,
    pub body: String,
    /// JSON array of attachment reference strings, as stored.
    pub attachments: String,
    pub created_at: String,
}

pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub message: String,
    pub category: String,
    pub status: String,
    pub created_at: String,
}

impl ThreadRow {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_lo == user_id || self.participant_hi == user_id
    }
}

impl MessageRow {
    pub fn attachments_vec(&self) -> Vec<String> {
        serde_json::from_str(&self.attachments).unwrap_or_else(|e| {
            warn!("Corrupt attachments on message '{}': {}", self.id, e);
            Vec::new()
        })
    }
}

/// Parse a stored timestamp. Rows written by this crate carry RFC 3339;
/// rows created through the SQL column default carry SQLite's
/// "YYYY-MM-DD HH:MM:SS" without timezone.
pub fn parse_uuid(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}
