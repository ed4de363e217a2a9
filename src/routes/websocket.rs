use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth::decode_access_token,
    middleware::school::SchoolContext,
    models::auth::AuthenticatedUser,
    services::notifications::channel_for,
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct WsQueryParams {
    pub token: String,
}

/// GET /ws — live notification badge + presence. The browser authenticates
/// with a token query param (websockets cannot set headers).
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    Query(params): Query<WsQueryParams>,
) -> Response {
    let jwt_secret = state.config.jwt_secret.clone();
    let auth_user = decode_access_token(&params.token, &jwt_secret);

    ws.on_upgrade(move |socket| async move {
        match auth_user {
            Ok(user) if user.school == school.subdomain => {
                info!(
                    profile = %user.profile_id,
                    school = %school.subdomain,
                    "WebSocket connected"
                );
                handle_socket(socket, state, school.id, user.profile_id).await;
            }
            Ok(_) => {
                error!("WebSocket rejected: token issued for another school");
            }
            Err(e) => {
                error!("WebSocket auth failed: {}", e);
            }
        }
    })
}

async fn handle_socket(socket: WebSocket, state: AppState, school_id: Uuid, profile_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();

    if let Err(e) = state.presence.track(school_id, profile_id).await {
        error!("Presence track failed: {}", e);
    }

    // Dedicated pub/sub connection for this socket.
    let channel = channel_for(school_id, profile_id);
    let mut pubsub = match state.redis_client.get_async_pubsub().await {
        Ok(c) => c,
        Err(e) => {
            error!("Redis pubsub error: {}", e);
            return;
        }
    };

    if let Err(e) = pubsub.subscribe(&channel).await {
        error!("Redis subscribe error: {}", e);
        return;
    }

    // Initial badge state so the client does not wait for the first event.
    let unread = state.notifications.unread_count(&state.db, profile_id).await;
    let hello = json!({ "type": "notifications", "payload": { "unread": unread } });
    if sender
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        let _ = state.presence.untrack(school_id, profile_id).await;
        return;
    }

    // Redis Pub/Sub → WebSocket
    let mut redis_task = tokio::spawn(async move {
        let mut pubsub_stream = pubsub.on_message();
        while let Some(msg) = pubsub_stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(_) => continue,
            };
            let ws_msg = json!({
                "type": "notifications",
                "payload": serde_json::from_str::<Value>(&payload)
                    .unwrap_or(Value::String(payload))
            });
            if sender
                .send(Message::Text(ws_msg.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Client → server: heartbeats keep the presence entry fresh.
    let presence = state.presence.clone();
    let mut client_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if text.trim() == "heartbeat" {
                        if let Err(e) = presence.heartbeat(school_id, profile_id).await {
                            error!("Presence heartbeat failed: {}", e);
                        }
                    }
                }
                Message::Ping(_) => {}
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut redis_task) => client_task.abort(),
        _ = (&mut client_task) => redis_task.abort(),
    }

    if let Err(e) = state.presence.untrack(school_id, profile_id).await {
        error!("Presence untrack failed: {}", e);
    }
    info!(profile = %profile_id, "WebSocket disconnected");
}

/// GET /api/presence — profile ids currently online in this school.
pub async fn online_members(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    _user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    let online = state
        .presence
        .online(school.id)
        .await
        .map_err(ApiError::Internal)?;

    Ok(Json(json!({ "online": online })))
}
