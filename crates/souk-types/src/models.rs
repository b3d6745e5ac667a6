use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// Denormalized pointer to the most recent message in a thread,
/// kept on the thread row for fast conversation previews.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessage {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// A direct conversation between exactly two users. The participant pair
/// is unordered: opening (a, b) and (b, a) resolves to the same thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub participants: [Uuid; 2],
    pub last_message: Option<LastMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub sender_id: Uuid,
    /// Per-thread sequence number; display order within a thread.
    pub seq: i64,
    pub body: String,
    /// Opaque attachment references (image URLs, upload ids).
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Unread,
    Read,
}

/// Per-user notification record. `category` is an open string — known
/// producers use "cart", "authentication" and "order".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub message: String,
    pub category: String,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
}
