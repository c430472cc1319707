use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::Response,
    routing::get,
    Json, Router,
};
use domain::{Identity, IdentityId};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{error::ApiError, state::RelayState, ws_connection::RelayConnection};

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_upgrade))
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<RelayState> {
    Router::new()
        .route("/users/connected", get(connected_users))
        .route("/users/connected/{id}", get(connected_user))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn websocket_upgrade(State(state): State<RelayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| RelayConnection::new(state).run(socket))
}

async fn connected_users(State(state): State<RelayState>) -> Json<Vec<Identity>> {
    Json(state.presence.snapshot().iter().cloned().collect())
}

async fn connected_user(
    State(state): State<RelayState>,
    Path(id): Path<String>,
) -> Result<Json<Identity>, ApiError> {
    let id = IdentityId::parse(id)?;
    state
        .presence
        .snapshot()
        .iter()
        .find(|identity| identity.id() == &id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("identity {id} is not connected")))
}
