use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use souk_types::events::GatewayEvent;

/// Manages all connected clients and fans out chat events.
///
/// Room-scoped events (`MessageNew`) go over one process-wide broadcast
/// channel; each connection filters against its joined-room set. Targeted
/// events (Ready, Joined, SendAck, Error) go over per-user mpsc channels.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for room-scoped gateway events
    broadcast_tx: broadcast::Sender<GatewayEvent>,

    /// Per-user targeted send channels: user_id -> (conn_id, sender)
    user_channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<GatewayEvent>)>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                user_channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to gateway events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients. Callers must only do
    /// this after the event's message is durably stored.
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a per-user targeted channel. Returns (conn_id, receiver).
    /// A reconnect replaces the previous channel; the old connection's
    /// conn_id no longer matches and cannot tear the new one down.
    pub async fn register_user_channel(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .user_channels
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        (conn_id, rx)
    }

    /// Unregister a per-user targeted channel, but only if conn_id matches.
    pub async fn unregister_user_channel(&self, user_id: Uuid, conn_id: Uuid) {
        let mut channels = self.inner.user_channels.write().await;
        if let Some((stored_conn_id, _)) = channels.get(&user_id) {
            if *stored_conn_id == conn_id {
                channels.remove(&user_id);
            }
        }
    }

    /// Send a targeted event to a specific user.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        let channels = self.inner.user_channels.read().await;
        if let Some((_, tx)) = channels.get(&user_id) {
            let _ = tx.send(event);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use souk_types::events::ErrorCode;

    fn message_event(thread_id: Uuid) -> GatewayEvent {
        GatewayEvent::MessageNew {
            id: Uuid::new_v4(),
            thread_id,
            sender_id: Uuid::new_v4(),
            sender_username: "alice".into(),
            seq: 1,
            body: "hello".into(),
            attachments: vec![],
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let dispatcher = Dispatcher::new();
        let mut rx1 = dispatcher.subscribe();
        let mut rx2 = dispatcher.subscribe();

        let tid = Uuid::new_v4();
        dispatcher.broadcast(message_event(tid));

        assert_eq!(rx1.recv().await.unwrap().thread_id(), Some(tid));
        assert_eq!(rx2.recv().await.unwrap().thread_id(), Some(tid));
    }

    #[tokio::test]
    async fn targeted_send_reaches_only_registered_user() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (_, mut alice_rx) = dispatcher.register_user_channel(alice).await;
        let (_, mut bob_rx) = dispatcher.register_user_channel(bob).await;

        dispatcher
            .send_to_user(
                alice,
                GatewayEvent::Error {
                    code: ErrorCode::Forbidden,
                    message: "not a participant".into(),
                },
            )
            .await;

        assert!(matches!(
            alice_rx.recv().await,
            Some(GatewayEvent::Error { .. })
        ));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_connection_cannot_unregister_newer_channel() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();

        let (old_conn, _old_rx) = dispatcher.register_user_channel(alice).await;
        let (_new_conn, mut new_rx) = dispatcher.register_user_channel(alice).await;

        // the old connection goes away after the reconnect
        dispatcher.unregister_user_channel(alice, old_conn).await;

        dispatcher
            .send_to_user(
                alice,
                GatewayEvent::Joined {
                    thread_id: Uuid::new_v4(),
                },
            )
            .await;
        assert!(matches!(
            new_rx.recv().await,
            Some(GatewayEvent::Joined { .. })
        ));
    }
}
