use axum::{
    debug_handler,
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_sessions::Session;

use crate::{connection, identity, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/websocket/", get(websocket))
        .route("/health", get(health))
        .route("/login", post(identity::login))
        .route("/logout", get(identity::logout))
}

/// Upgrades signed-in visitors only; everyone else gets a 401.
#[debug_handler(state = AppState)]
pub(crate) async fn websocket(
    State(state): State<AppState>,
    session: Session,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(identity) = identity::resolve(&session).await else {
        return (StatusCode::UNAUTHORIZED, "sign in first").into_response();
    };

    ws.on_upgrade(move |socket| connection::serve(socket, identity, state))
}

#[debug_handler]
pub(crate) async fn health() -> &'static str {
    "ok"
}
