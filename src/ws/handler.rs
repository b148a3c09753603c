//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::MatchInput;
use crate::http::middleware::verify_jwt;
use crate::matchmaking::MatchmakingError;
use crate::store::profiles::default_display_name;
use crate::util::rate_limit::PlayerRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// JWT token for authentication
    pub token: String,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Verify JWT token before upgrading
    match verify_jwt(&query.token, &state.config.supabase_jwt_secret) {
        Ok(claims) => {
            info!(user_id = %claims.sub, "WebSocket upgrade for authenticated user");
            ws.on_upgrade(move |socket| handle_socket(socket, claims.sub, state))
        }
        Err(e) => {
            warn!(error = %e, "WebSocket auth failed");
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, user_id: Uuid, state: AppState) {
    info!(user_id = %user_id, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();

    // Matchmaking looks players up by profile, make sure there is one
    if let Err(e) = state
        .profile_store
        .ensure_profile(user_id, &default_display_name(user_id))
        .await
    {
        error!(user_id = %user_id, error = %e, "Failed to ensure profile");
    }

    let welcome = ServerMsg::Welcome {
        user_id,
        server_time: unix_millis(),
    };

    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(user_id = %user_id, error = %e, "Failed to send welcome");
        return;
    }

    let (connection_id, outbound_rx) = state.matchmaking.register_player(user_id);

    run_session(&state, user_id, ws_sink, ws_stream, outbound_rx).await;

    // Cleanup on disconnect
    state
        .matchmaking
        .unregister_player(user_id, connection_id)
        .await;

    info!(user_id = %user_id, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    state: &AppState,
    user_id: Uuid,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
    mut outbound_rx: mpsc::Receiver<ServerMsg>,
) {
    let rate_limiter = PlayerRateLimiter::new();
    // Direct replies to this connection (pong, errors)
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMsg>(32);

    // Writer task: matchmaking/match messages and replies -> WebSocket
    let writer_handle = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(msg) = outbound_rx.recv() => msg,
                Some(msg) = reply_rx.recv() => msg,
                else => break,
            };

            if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                debug!(user_id = %user_id, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    // Reader loop: WebSocket -> matchmaking / match loop
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let client_msg = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Failed to parse client message");
                        let _ = reply_tx.try_send(ServerMsg::error("invalid_message", e));
                        continue;
                    }
                };

                if !allowed(&rate_limiter, &client_msg) {
                    warn!(user_id = %user_id, "Rate limited client message");
                    let _ = reply_tx.try_send(ServerMsg::error("rate_limited", "Too many messages"));
                    continue;
                }

                match handle_client_msg(state, user_id, client_msg).await {
                    Ok(Some(reply)) => {
                        let _ = reply_tx.try_send(reply);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(user_id = %user_id, error = %e, "Client request failed");
                        let _ = reply_tx.try_send(e.to_server_msg());
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(user_id = %user_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(user_id = %user_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    writer_handle.abort();
}

fn allowed(limiter: &PlayerRateLimiter, msg: &ClientMsg) -> bool {
    match msg {
        ClientMsg::Enqueue { .. } | ClientMsg::Dequeue => limiter.check_matchmaking(),
        _ => limiter.check_input(),
    }
}

/// Dispatch one client message. Returns a direct reply, if any.
async fn handle_client_msg(
    state: &AppState,
    user_id: Uuid,
    msg: ClientMsg,
) -> Result<Option<ServerMsg>, MatchmakingError> {
    let matchmaking = &state.matchmaking;

    match msg {
        ClientMsg::Enqueue { match_type } => {
            matchmaking.enqueue(user_id, match_type).await?;
        }
        ClientMsg::Dequeue => matchmaking.dequeue(user_id).await?,
        ClientMsg::JoinMatch { match_id } => matchmaking.join_match(user_id, match_id).await?,
        ClientMsg::Ready { match_id } => {
            matchmaking
                .route_input(user_id, match_id, MatchInput::Ready)
                .await?
        }
        ClientMsg::PaddleMove { match_id, side, y } => {
            matchmaking
                .route_input(user_id, match_id, MatchInput::PaddleMove { side, y })
                .await?
        }
        ClientMsg::Forfeit { match_id } => {
            matchmaking
                .route_input(user_id, match_id, MatchInput::Forfeit)
                .await?
        }
        ClientMsg::Ping { t } => return Ok(Some(ServerMsg::Pong { t })),
    }

    Ok(None)
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
