use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use application::{HistoryPage, MarkReadRequest, PageQuery, RoomPage, SendMessageRequest};
use domain::{GlobalMessage, Message, MessageId, ReadReceipt, RoomId, UserId};

use crate::{error::ApiError, state::AppState, ws_connection::WebSocketConnection};

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    content: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct PresenceResponse {
    online_users: Vec<UserId>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/chat-rooms", get(list_rooms))
        .route(
            "/chat-rooms/{room_id}/messages",
            post(send_message).get(get_history),
        )
        .route(
            "/chat-rooms/{room_id}/messages/{message_id}/read",
            post(mark_read),
        )
        .route("/global-chat", post(send_global).get(get_global))
        .route("/presence", get(presence))
        .route("/ws", get(websocket_upgrade))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn list_rooms(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<RoomPage>, ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;
    let page = state.chat_service.list_rooms(user_id, query).await?;
    Ok(Json(page))
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<RoomId>,
    Json(payload): Json<SendMessagePayload>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let sender_id = state.jwt_service.extract_user_from_headers(&headers)?;
    let message = state
        .chat_service
        .send_message(SendMessageRequest {
            room_id,
            sender_id,
            content: payload.content,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

async fn get_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<RoomId>,
    Query(query): Query<PageQuery>,
) -> Result<Json<HistoryPage>, ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;
    let page = state.chat_service.history(room_id, user_id, query).await?;
    Ok(Json(page))
}

async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((room_id, message_id)): Path<(RoomId, MessageId)>,
) -> Result<Json<ReadReceipt>, ApiError> {
    let reader_id = state.jwt_service.extract_user_from_headers(&headers)?;
    let receipt = state
        .chat_service
        .mark_read(MarkReadRequest {
            room_id,
            message_id,
            reader_id,
        })
        .await?;

    Ok(Json(receipt))
}

async fn send_global(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SendMessagePayload>,
) -> Result<(StatusCode, Json<GlobalMessage>), ApiError> {
    let sender_id = state.jwt_service.extract_user_from_headers(&headers)?;
    let message = state
        .chat_service
        .send_global(sender_id, payload.content)
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

async fn get_global(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<GlobalMessage>>, ApiError> {
    state.jwt_service.extract_user_from_headers(&headers)?;
    let messages = state.chat_service.global_history().await?;
    Ok(Json(messages))
}

async fn presence(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<PresenceResponse>, ApiError> {
    state.jwt_service.extract_user_from_headers(&headers)?;
    let online_users = state.hub.online_users().await;
    Ok(Json(PresenceResponse { online_users }))
}

/// 认证在升级之前完成，失败时不会创建任何连接状态
async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user_id = state
        .jwt_service
        .authenticate_upgrade(query.token.as_deref(), &headers)
        .inspect_err(|err| tracing::warn!(reason = err.message(), "websocket authentication rejected"))?;

    Ok(ws.on_upgrade(move |socket| WebSocketConnection::new(state, user_id).run(socket)))
}
