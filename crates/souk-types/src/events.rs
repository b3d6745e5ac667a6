use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// Server confirms a room subscription
    Joined { thread_id: Uuid },

    /// A new message was persisted in a thread
    MessageNew {
        id: Uuid,
        thread_id: Uuid,
        sender_id: Uuid,
        sender_username: String,
        seq: i64,
        body: String,
        attachments: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Acknowledges a `Send` command back to the sender only.
    /// Emitted after the message is durably stored.
    SendAck {
        thread_id: Uuid,
        message_id: Uuid,
        seq: i64,
    },

    /// Targeted error for a failed command
    Error { code: ErrorCode, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidPayload,
    NotFound,
    Forbidden,
    StoreError,
}

impl GatewayEvent {
    /// Returns the thread_id if this event is scoped to a specific room.
    /// Events that return `None` are targeted and never broadcast.
    pub fn thread_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageNew { thread_id, .. } => Some(*thread_id),
            // Ready, Joined, SendAck, Error go over the per-user channel
            _ => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Subscribe to a thread's room. The server verifies the caller is a
    /// participant of the thread before subscribing.
    Join { thread_id: Uuid },

    /// Unsubscribe from a thread's room
    Leave { thread_id: Uuid },

    /// Persist a message and broadcast it to the room.
    /// The broadcast happens only after the store write succeeds.
    Send {
        thread_id: Uuid,
        body: String,
        #[serde(default)]
        attachments: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_deserialize_from_tagged_json() {
        let cmd: GatewayCommand = serde_json::from_str(
            r#"{"type":"Join","data":{"thread_id":"00000000-0000-0000-0000-000000000001"}}"#,
        )
        .unwrap();
        assert!(matches!(cmd, GatewayCommand::Join { .. }));

        // attachments defaults to empty when omitted
        let cmd: GatewayCommand = serde_json::from_str(
            r#"{"type":"Send","data":{"thread_id":"00000000-0000-0000-0000-000000000001","body":"hi"}}"#,
        )
        .unwrap();
        match cmd {
            GatewayCommand::Send { body, attachments, .. } => {
                assert_eq!(body, "hi");
                assert!(attachments.is_empty());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn room_scoping_covers_only_broadcast_events() {
        let tid = Uuid::new_v4();
        let msg = GatewayEvent::MessageNew {
            id: Uuid::new_v4(),
            thread_id: tid,
            sender_id: Uuid::new_v4(),
            sender_username: "alice".into(),
            seq: 1,
            body: "hello".into(),
            attachments: vec![],
            timestamp: Utc::now(),
        };
        assert_eq!(msg.thread_id(), Some(tid));

        let ack = GatewayEvent::SendAck {
            thread_id: tid,
            message_id: Uuid::new_v4(),
            seq: 1,
        };
        assert_eq!(ack.thread_id(), None);
    }
}
