use std::time::Duration;

use axum::{http::StatusCode, response::{IntoResponse, Response}};
use uuid::Uuid;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("user {user_id} is already bound to chatroom {chatroom_id}")]
    DuplicateMember { chatroom_id: Uuid, user_id: Uuid },

    #[error("chatroom name {0:?} is already taken")]
    NameTaken(String),

    #[error("chatroom {0} not found")]
    ChatroomNotFound(Uuid),

    #[error("chatroom {0} is reserved")]
    ReservedChatroom(Uuid),

    #[error("chatroom name cannot be empty")]
    EmptyName,

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("broker: {0}")]
    Broker(#[from] lapin::Error),

    #[error("publish to chatroom {0} timed out")]
    PublishTimeout(Uuid),

    #[error("envelope: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("transport: {0}")]
    Transport(#[from] axum::Error),

    #[error("no pong within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("connection closed (code {0:?})")]
    Closed(Option<u16>),

    #[error("delivery channel closed")]
    DeliveryClosed,
}

/// Error type of the HTTP handlers. Renders as a 500 with the error chain.
pub type AppResult<T> = std::result::Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = ?self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{:#}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
