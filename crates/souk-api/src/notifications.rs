use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use souk_db::models::{NotificationRow, parse_timestamp, parse_uuid};
use souk_types::api::{Claims, CreateNotificationRequest};
use souk_types::models::{Notification, NotificationStatus};

use crate::auth::AppState;
use crate::error::{ApiError, join_error};

pub async fn create_notification(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateNotificationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Uuid::new_v4();
    let db = state.db.clone();
    let user_id = claims.sub.to_string();

    let row = tokio::task::spawn_blocking(move || {
        db.create_notification(&id.to_string(), &user_id, &req.message, &req.category)
    })
    .await
    .map_err(join_error)??;

    Ok((StatusCode::CREATED, Json(notification_to_response(&row))))
}

/// The caller's notifications, newest first. Notifications are polled over
/// HTTP; they are not pushed through the gateway.
pub async fn list_notifications(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();

    let rows = tokio::task::spawn_blocking(move || db.list_notifications(&user_id))
        .await
        .map_err(join_error)??;

    let notifications: Vec<Notification> = rows.iter().map(notification_to_response).collect();
    Ok(Json(notifications))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();

    let row = tokio::task::spawn_blocking(move || {
        db.mark_notification_read(&user_id, &notification_id.to_string())
    })
    .await
    .map_err(join_error)??;

    Ok(Json(notification_to_response(&row)))
}

pub async fn delete_notification(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();

    tokio::task::spawn_blocking(move || {
        db.delete_notification(&user_id, &notification_id.to_string())
    })
    .await
    .map_err(join_error)??;

    Ok(StatusCode::NO_CONTENT)
}

fn notification_to_response(row: &NotificationRow) -> Notification {
    let status = match row.status.as_str() {
        "read" => NotificationStatus::Read,
        _ => NotificationStatus::Unread,
    };

    Notification {
        id: parse_uuid(&row.id, "notification id"),
        user_id: parse_uuid(&row.user_id, "user id"),
        message: row.message.clone(),
        category: row.category.clone(),
        status,
        created_at: parse_timestamp(&row.created_at),
    }
}

