use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use souk_db::models::{ThreadRow, parse_timestamp, parse_uuid};
use souk_types::api::{
    Claims, MessageResponse, OpenThreadRequest, SendMessageRequest, ThreadResponse,
};
use souk_types::events::GatewayEvent;
use souk_types::models::LastMessage;

use crate::auth::AppState;
use crate::error::{ApiError, join_error};

/// Get-or-create the direct thread between the caller and a peer.
/// Both orderings of the pair resolve to the same thread.
pub async fn open_thread(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<OpenThreadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let caller = claims.sub.to_string();
    let peer = req.peer_id.to_string();

    let row = tokio::task::spawn_blocking(move || db.open_thread(&caller, &peer))
        .await
        .map_err(join_error)??;

    Ok(Json(thread_to_response(&row)))
}

/// Thread metadata including the last-message summary. Participants only.
pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let row = fetch_participant_thread(&state, thread_id, claims.sub).await?;
    Ok(Json(thread_to_response(&row)))
}

/// Full message history for a thread, oldest first. Participants only.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let thread = fetch_participant_thread(&state, thread_id, claims.sub).await?;

    // Resolve both participants' display names once instead of per message
    let db = state.db.clone();
    let (rows, usernames) = tokio::task::spawn_blocking(move || {
        let rows = db.list_messages(&thread.id)?;

        let mut usernames: HashMap<String, String> = HashMap::new();
        for pid in [&thread.participant_lo, &thread.participant_hi] {
            let name = db
                .get_user_by_id(pid)?
                .map(|u| u.username)
                .unwrap_or_else(|| "unknown".to_string());
            usernames.insert(pid.clone(), name);
        }

        Ok::<_, ApiError>((rows, usernames))
    })
    .await
    .map_err(join_error)??;

    let messages: Vec<MessageResponse> = rows
        .iter()
        .map(|row| {
            let sender_username = usernames
                .get(&row.sender_id)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());

            MessageResponse {
                id: parse_uuid(&row.id, "message id"),
                thread_id,
                sender_id: parse_uuid(&row.sender_id, "sender id"),
                sender_username,
                seq: row.seq,
                body: row.body.clone(),
                attachments: row.attachments_vec(),
                created_at: parse_timestamp(&row.created_at),
            }
        })
        .collect();

    Ok(Json(messages))
}

/// Persist a message and broadcast it to the thread's room. The HTTP
/// transport over the same store path the WebSocket relay uses; the
/// broadcast happens only after persistence succeeds.
pub async fn send_message(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    fetch_participant_thread(&state, thread_id, claims.sub).await?;

    let message_id = Uuid::new_v4();
    let db = state.db.clone();
    let sender = claims.sub;
    let body = req.body;
    let attachments = req.attachments;

    let row = tokio::task::spawn_blocking(move || {
        db.create_message(
            &message_id.to_string(),
            &thread_id.to_string(),
            &sender.to_string(),
            &body,
            &attachments,
        )
    })
    .await
    .map_err(join_error)??;

    let created_at = parse_timestamp(&row.created_at);
    let attachments = row.attachments_vec();

    state.dispatcher.broadcast(GatewayEvent::MessageNew {
        id: message_id,
        thread_id,
        sender_id: claims.sub,
        sender_username: claims.username.clone(),
        seq: row.seq,
        body: row.body.clone(),
        attachments: attachments.clone(),
        timestamp: created_at,
    });

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            id: message_id,
            thread_id,
            sender_id: claims.sub,
            sender_username: claims.username,
            seq: row.seq,
            body: row.body,
            attachments,
            created_at,
        }),
    ))
}

/// Look up a thread and enforce that the caller is one of its participants.
async fn fetch_participant_thread(
    state: &AppState,
    thread_id: Uuid,
    user_id: Uuid,
) -> Result<ThreadRow, ApiError> {
    let db = state.db.clone();
    let row = tokio::task::spawn_blocking(move || db.get_thread(&thread_id.to_string()))
        .await
        .map_err(join_error)??
        .ok_or(ApiError::NotFound("thread"))?;

    if !row.is_participant(&user_id.to_string()) {
        return Err(ApiError::Forbidden);
    }
    Ok(row)
}

fn thread_to_response(row: &ThreadRow) -> ThreadResponse {
    let last_message = match (&row.last_message_id, &row.last_message_at) {
        (Some(id), Some(at)) => Some(LastMessage {
            message_id: parse_uuid(id, "last message id"),
            timestamp: parse_timestamp(at),
        }),
        _ => None,
    };

    ThreadResponse {
        id: parse_uuid(&row.id, "thread id"),
        participants: [
            parse_uuid(&row.participant_lo, "participant id"),
            parse_uuid(&row.participant_hi, "participant id"),
        ],
        last_message,
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
    }
}
