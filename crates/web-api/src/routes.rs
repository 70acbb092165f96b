use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::{error::ApiError, state::AppState, ws_connection::GatewayConnection};
use domain::RoomId;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms/{room_id}/online", get(room_online))
        .route("/ws", get(websocket_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    /// 模式清单是否已加载；false 时所有入站信封都会被拒绝
    schema_loaded: bool,
    connections: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        schema_loaded: state.codec.is_ready(),
        connections: state.registry.connection_count(),
    })
}

#[derive(Debug, Serialize)]
struct OnlineBody {
    room_id: String,
    online: Vec<String>,
}

async fn room_online(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<OnlineBody>, ApiError> {
    let room = RoomId::new(room_id.clone());
    let online = state.presence.online(&room).await?;
    Ok(Json(OnlineBody {
        room_id,
        online: online.into_iter().map(|s| s.as_str().to_string()).collect(),
    }))
}

async fn websocket_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| GatewayConnection::new(socket, state).run())
}
