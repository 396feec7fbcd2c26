mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{ChatLogEntry, Chatroom, Identity};

pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chatroom id {0} already exists")]
    IdCollision(Uuid),

    #[error("chatroom name {0:?} already taken")]
    NameTaken(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable chatroom metadata, history and membership.
#[async_trait]
pub trait ChatroomStore: Send + Sync {
    /// History of a chatroom, oldest first.
    async fn select_chatroom_logs(&self, chatroom_id: Uuid) -> StoreResult<Vec<ChatLogEntry>>;

    async fn insert_chatroom_log(&self, entry: &ChatLogEntry) -> StoreResult<()>;

    /// Fails with [`StoreError::IdCollision`] or [`StoreError::NameTaken`]
    /// without writing anything.
    async fn create_chatroom(&self, chatroom_id: Uuid, name: &str) -> StoreResult<()>;

    /// Renames a chatroom. Membership deltas are accepted but not applied yet.
    async fn update_chatroom(
        &self,
        chatroom_id: Uuid,
        new_name: &str,
        add_users: &[Uuid],
        remove_users: &[Uuid],
    ) -> StoreResult<()>;

    async fn delete_chatroom(&self, chatroom_id: Uuid) -> StoreResult<()>;

    async fn select_chatroom_entry(&self, chatroom_id: Uuid) -> StoreResult<Chatroom>;

    /// Idempotent.
    async fn add_user_to_chatroom(&self, chatroom_id: Uuid, user_id: Uuid) -> StoreResult<()>;

    async fn select_chatroom_users(&self, chatroom_id: Uuid) -> StoreResult<Vec<Identity>>;

    async fn select_user_chatrooms(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>>;

    /// Upserts the display name keyed by user id.
    async fn store_username(&self, user: &Identity) -> StoreResult<()>;
}
