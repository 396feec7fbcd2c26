use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{
    from_unix_millis, unix_millis, ChatLogEntry, Chatroom, Identity, MAIN_CHAT_ID, MAIN_CHAT_NAME,
};

use super::{ChatroomStore, StoreError, StoreResult};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS chatrooms (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL UNIQUE,
        is_active INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS chat_logs (
        chatroom_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        user_name TEXT NOT NULL,
        text TEXT NOT NULL,
        timestamp_ms INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS chat_logs_by_chatroom ON chat_logs (chatroom_id, timestamp_ms)",
    "CREATE TABLE IF NOT EXISTS chatroom_users (
        chatroom_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        PRIMARY KEY (chatroom_id, user_id)
    )",
    "CREATE INDEX IF NOT EXISTS chatroom_users_by_user ON chatroom_users (user_id)",
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL
    )",
];

#[derive(Clone)]
pub struct SqliteStore {
    db_pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    /// Creates missing tables and makes sure the main chatroom exists.
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.db_pool).await?;
        }

        sqlx::query("INSERT OR IGNORE INTO chatrooms (id,name,is_active) VALUES (?,?,1)")
            .bind(MAIN_CHAT_ID.to_string())
            .bind(MAIN_CHAT_NAME)
            .execute(&self.db_pool)
            .await?;

        tracing::debug!("chatroom schema ready");
        Ok(())
    }
}

fn parse_id(raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|err| StoreError::Database(sqlx::Error::Decode(Box::new(err))))
}

/// Sorts unique violations on the chatrooms table into id and name clashes.
fn chatroom_conflict(err: sqlx::Error, chatroom_id: Uuid, name: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            if db_err.message().contains("chatrooms.name") {
                return StoreError::NameTaken(name.to_owned());
            }
            if db_err.message().contains("chatrooms.id") {
                return StoreError::IdCollision(chatroom_id);
            }
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl ChatroomStore for SqliteStore {
    async fn select_chatroom_logs(&self, chatroom_id: Uuid) -> StoreResult<Vec<ChatLogEntry>> {
        let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            "SELECT user_id,user_name,text,timestamp_ms FROM chat_logs
             WHERE chatroom_id=? ORDER BY timestamp_ms, rowid",
        )
        .bind(chatroom_id.to_string())
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|(user_id, user_name, text, timestamp_ms)| {
                Ok(ChatLogEntry {
                    chatroom_id,
                    user_id: parse_id(&user_id)?,
                    user_name,
                    text,
                    timestamp: from_unix_millis(timestamp_ms),
                })
            })
            .collect()
    }

    async fn insert_chatroom_log(&self, entry: &ChatLogEntry) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO chat_logs (chatroom_id,user_id,user_name,text,timestamp_ms)
             VALUES (?,?,?,?,?)",
        )
        .bind(entry.chatroom_id.to_string())
        .bind(entry.user_id.to_string())
        .bind(&entry.user_name)
        .bind(&entry.text)
        .bind(unix_millis(entry.timestamp))
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn create_chatroom(&self, chatroom_id: Uuid, name: &str) -> StoreResult<()> {
        sqlx::query("INSERT INTO chatrooms (id,name,is_active) VALUES (?,?,1)")
            .bind(chatroom_id.to_string())
            .bind(name)
            .execute(&self.db_pool)
            .await
            .map_err(|err| chatroom_conflict(err, chatroom_id, name))?;
        Ok(())
    }

    async fn update_chatroom(
        &self,
        chatroom_id: Uuid,
        new_name: &str,
        _add_users: &[Uuid],
        _remove_users: &[Uuid],
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE chatrooms SET name=? WHERE id=?")
            .bind(new_name)
            .bind(chatroom_id.to_string())
            .execute(&self.db_pool)
            .await
            .map_err(|err| chatroom_conflict(err, chatroom_id, new_name))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("chatroom {chatroom_id}")));
        }
        Ok(())
    }

    async fn delete_chatroom(&self, chatroom_id: Uuid) -> StoreResult<()> {
        let mut tx = self.db_pool.begin().await?;

        let result = sqlx::query("DELETE FROM chatrooms WHERE id=?")
            .bind(chatroom_id.to_string())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("chatroom {chatroom_id}")));
        }

        // Stale memberships would make the next initial connect fail.
        sqlx::query("DELETE FROM chatroom_users WHERE chatroom_id=?")
            .bind(chatroom_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn select_chatroom_entry(&self, chatroom_id: Uuid) -> StoreResult<Chatroom> {
        let Some((name, is_active)): Option<(String, bool)> =
            sqlx::query_as("SELECT name,is_active FROM chatrooms WHERE id=?")
                .bind(chatroom_id.to_string())
                .fetch_optional(&self.db_pool)
                .await?
        else {
            return Err(StoreError::NotFound(format!("chatroom {chatroom_id}")));
        };

        Ok(Chatroom {
            id: chatroom_id,
            name,
            is_active,
        })
    }

    async fn add_user_to_chatroom(&self, chatroom_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        sqlx::query("INSERT OR IGNORE INTO chatroom_users (chatroom_id,user_id) VALUES (?,?)")
            .bind(chatroom_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    async fn select_chatroom_users(&self, chatroom_id: Uuid) -> StoreResult<Vec<Identity>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT cu.user_id, COALESCE(u.name, '') FROM chatroom_users cu
             LEFT JOIN users u ON u.id = cu.user_id
             WHERE cu.chatroom_id=? ORDER BY cu.rowid",
        )
        .bind(chatroom_id.to_string())
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|(id, name)| Ok(Identity { id: parse_id(&id)?, name }))
            .collect()
    }

    async fn select_user_chatrooms(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT chatroom_id FROM chatroom_users WHERE user_id=? ORDER BY rowid")
                .bind(user_id.to_string())
                .fetch_all(&self.db_pool)
                .await?;

        rows.into_iter().map(|(id,)| parse_id(&id)).collect()
    }

    async fn store_username(&self, user: &Identity) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO users (id,name) VALUES (?,?)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name",
        )
            .bind(user.id.to_string())
            .bind(&user.name)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }
}
