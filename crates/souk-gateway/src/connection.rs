use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use souk_db::{Database, StoreError};
use souk_db::models::parse_timestamp;
use souk_types::events::{ErrorCode, GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a single WebSocket connection: Identify handshake, then the
/// room-subscription event loop.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    // Step 2: Send Ready event
    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    run_connection_loop(sender, receiver, dispatcher, db, user_id, username).await;
}

async fn run_connection_loop(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user_id: Uuid,
    username: String,
) {
    // Register the targeted channel for acks/errors before anything can race
    let (conn_id, mut user_rx) = dispatcher.register_user_channel(user_id).await;

    // Subscribe to broadcasts and relay to this client
    let mut broadcast_rx = dispatcher.subscribe();
    let dispatcher_clone = dispatcher.clone();

    // Per-connection room subscriptions (shared between send and recv tasks).
    let joined_rooms: Arc<std::sync::RwLock<HashSet<Uuid>>> =
        Arc::new(std::sync::RwLock::new(HashSet::new()));
    let send_rooms = joined_rooms.clone();

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward room broadcasts + targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    {
                        let rooms = send_rooms.read().expect("room lock poisoned");
                        if !wants_event(&rooms, &event) {
                            continue;
                        }
                    }

                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };

                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let username_recv = username.clone();
    let recv_rooms = joined_rooms.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(
                            &dispatcher_clone,
                            &db,
                            user_id,
                            &username_recv,
                            cmd,
                            &recv_rooms,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            &text[..text.len().min(200)]
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister_user_channel(user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

/// Room filter: thread-scoped events are delivered only to connections
/// joined to that room; unscoped broadcasts pass through.
fn wants_event(joined: &HashSet<Uuid>, event: &GatewayEvent) -> bool {
    match event.thread_id() {
        Some(thread_id) => joined.contains(&thread_id),
        None => true,
    }
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};
    use souk_types::api::Claims;

    let timeout = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    user_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
    joined: &Arc<std::sync::RwLock<HashSet<Uuid>>>,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::Join { thread_id } => {
            match fetch_thread(db, thread_id).await {
                Ok(Some(thread)) if thread.is_participant(&user_id.to_string()) => {
                    joined
                        .write()
                        .expect("room lock poisoned")
                        .insert(thread_id);
                    info!("{} ({}) joined room {}", username, user_id, thread_id);
                    dispatcher
                        .send_to_user(user_id, GatewayEvent::Joined { thread_id })
                        .await;
                }
                Ok(Some(_)) => {
                    warn!(
                        "{} ({}) denied join to room {}: not a participant",
                        username, user_id, thread_id
                    );
                    dispatcher
                        .send_to_user(
                            user_id,
                            GatewayEvent::Error {
                                code: ErrorCode::Forbidden,
                                message: "not a participant of this thread".into(),
                            },
                        )
                        .await;
                }
                Ok(None) => {
                    dispatcher
                        .send_to_user(
                            user_id,
                            GatewayEvent::Error {
                                code: ErrorCode::NotFound,
                                message: "thread not found".into(),
                            },
                        )
                        .await;
                }
                Err(event) => dispatcher.send_to_user(user_id, event).await,
            }
        }

        GatewayCommand::Leave { thread_id } => {
            joined
                .write()
                .expect("room lock poisoned")
                .remove(&thread_id);
        }

        GatewayCommand::Send {
            thread_id,
            body,
            attachments,
        } => {
            // Authorization mirrors Join: only participants may inject
            match fetch_thread(db, thread_id).await {
                Ok(Some(thread)) if thread.is_participant(&user_id.to_string()) => {}
                Ok(Some(_)) => {
                    dispatcher
                        .send_to_user(
                            user_id,
                            GatewayEvent::Error {
                                code: ErrorCode::Forbidden,
                                message: "not a participant of this thread".into(),
                            },
                        )
                        .await;
                    return;
                }
                Ok(None) => {
                    dispatcher
                        .send_to_user(
                            user_id,
                            GatewayEvent::Error {
                                code: ErrorCode::NotFound,
                                message: "thread not found".into(),
                            },
                        )
                        .await;
                    return;
                }
                Err(event) => {
                    dispatcher.send_to_user(user_id, event).await;
                    return;
                }
            }

            // Persist first; broadcast only on persistence success.
            let message_id = Uuid::new_v4();
            let db_clone = db.clone();
            let body_clone = body.clone();
            let result = tokio::task::spawn_blocking(move || {
                db_clone.create_message(
                    &message_id.to_string(),
                    &thread_id.to_string(),
                    &user_id.to_string(),
                    &body_clone,
                    &attachments,
                )
            })
            .await;

            match result {
                Ok(Ok(row)) => {
                    dispatcher.broadcast(GatewayEvent::MessageNew {
                        id: message_id,
                        thread_id,
                        sender_id: user_id,
                        sender_username: username.to_string(),
                        seq: row.seq,
                        body: row.body.clone(),
                        attachments: row.attachments_vec(),
                        timestamp: parse_timestamp(&row.created_at),
                    });
                    dispatcher
                        .send_to_user(
                            user_id,
                            GatewayEvent::SendAck {
                                thread_id,
                                message_id,
                                seq: row.seq,
                            },
                        )
                        .await;
                }
                Ok(Err(e)) => {
                    warn!(
                        "{} ({}) send to {} failed: {}",
                        username, user_id, thread_id, e
                    );
                    dispatcher.send_to_user(user_id, store_error_event(&e)).await;
                }
                Err(e) => {
                    error!("spawn_blocking join error: {}", e);
                    dispatcher
                        .send_to_user(
                            user_id,
                            GatewayEvent::Error {
                                code: ErrorCode::StoreError,
                                message: "internal error".into(),
                            },
                        )
                        .await;
                }
            }
        }
    }
}

/// Blocking thread lookup off the async runtime. A store failure comes
/// back pre-mapped to the error event for the caller to relay.
async fn fetch_thread(
    db: &Arc<Database>,
    thread_id: Uuid,
) -> Result<Option<souk_db::models::ThreadRow>, GatewayEvent> {
    let db = db.clone();
    match tokio::task::spawn_blocking(move || db.get_thread(&thread_id.to_string())).await {
        Ok(Ok(thread)) => Ok(thread),
        Ok(Err(e)) => {
            warn!("thread lookup failed: {}", e);
            Err(store_error_event(&e))
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            Err(GatewayEvent::Error {
                code: ErrorCode::StoreError,
                message: "internal error".into(),
            })
        }
    }
}

fn store_error_event(e: &StoreError) -> GatewayEvent {
    let code = match e {
        StoreError::Validation(_) => ErrorCode::InvalidPayload,
        StoreError::NotFound(_) => ErrorCode::NotFound,
        _ => ErrorCode::StoreError,
    };
    GatewayEvent::Error {
        code,
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn room_filter_delivers_only_to_joined_connections() {
        let room = Uuid::new_v4();
        let other_room = Uuid::new_v4();

        let mut joined = HashSet::new();
        joined.insert(room);
        let not_joined: HashSet<Uuid> = HashSet::new();

        let event = message_event(room);
        assert!(wants_event(&joined, &event));
        assert!(!wants_event(&not_joined, &event));
        assert!(!wants_event(&joined, &message_event(other_room)));
    }

    #[test]
    fn store_errors_map_to_event_codes() {
        let validation = StoreError::validation("empty body");
        let not_found = StoreError::NotFound("thread");

        assert!(matches!(
            store_error_event(&validation),
            GatewayEvent::Error {
                code: ErrorCode::InvalidPayload,
                ..
            }
        ));
        assert!(matches!(
            store_error_event(&not_found),
            GatewayEvent::Error {
                code: ErrorCode::NotFound,
                ..
            }
        ));
    }
}
