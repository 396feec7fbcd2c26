#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chatrooms::{
    broker::LocalBroker,
    directory::Directory,
    envelope::{ChatroomMessage, Envelope, TextMessage},
    models::{ChatLogEntry, Chatroom, DeliveryReceiver, Identity},
    session::Session,
    store::{ChatroomStore, SqliteStore, StoreError, StoreResult},
};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use uuid::Uuid;

/// Forwards to an inner store and counts every call. Log inserts and id
/// collisions can be forced to fail.
pub struct CountingStore {
    inner: SqliteStore,
    calls: AtomicUsize,
    fail_inserts: AtomicBool,
    id_collisions: AtomicUsize,
    attempted_ids: Mutex<Vec<Uuid>>,
}

impl CountingStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every later log insert fails with a database error.
    pub fn fail_inserts(&self) {
        self.fail_inserts.store(true, Ordering::SeqCst);
    }

    /// The next `times` chatroom creations report an id collision.
    pub fn collide_ids(&self, times: usize) {
        self.id_collisions.store(times, Ordering::SeqCst);
    }

    /// Every id passed to `create_chatroom`, in call order.
    pub fn attempted_ids(&self) -> Vec<Uuid> {
        self.attempted_ids.lock().unwrap().clone()
    }

    fn hit(&self) -> &SqliteStore {
        self.calls.fetch_add(1, Ordering::SeqCst);
        &self.inner
    }
}

#[async_trait]
impl ChatroomStore for CountingStore {
    async fn select_chatroom_logs(&self, chatroom_id: Uuid) -> StoreResult<Vec<ChatLogEntry>> {
        self.hit().select_chatroom_logs(chatroom_id).await
    }

    async fn insert_chatroom_log(&self, entry: &ChatLogEntry) -> StoreResult<()> {
        let inner = self.hit();
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        inner.insert_chatroom_log(entry).await
    }

    async fn create_chatroom(&self, chatroom_id: Uuid, name: &str) -> StoreResult<()> {
        let inner = self.hit();
        self.attempted_ids.lock().unwrap().push(chatroom_id);
        let collide = self
            .id_collisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if collide {
            return Err(StoreError::IdCollision(chatroom_id));
        }
        inner.create_chatroom(chatroom_id, name).await
    }

    async fn update_chatroom(
        &self,
        chatroom_id: Uuid,
        new_name: &str,
        add_users: &[Uuid],
        remove_users: &[Uuid],
    ) -> StoreResult<()> {
        self.hit()
            .update_chatroom(chatroom_id, new_name, add_users, remove_users)
            .await
    }

    async fn delete_chatroom(&self, chatroom_id: Uuid) -> StoreResult<()> {
        self.hit().delete_chatroom(chatroom_id).await
    }

    async fn select_chatroom_entry(&self, chatroom_id: Uuid) -> StoreResult<Chatroom> {
        self.hit().select_chatroom_entry(chatroom_id).await
    }

    async fn add_user_to_chatroom(&self, chatroom_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        self.hit().add_user_to_chatroom(chatroom_id, user_id).await
    }

    async fn select_chatroom_users(&self, chatroom_id: Uuid) -> StoreResult<Vec<Identity>> {
        self.hit().select_chatroom_users(chatroom_id).await
    }

    async fn select_user_chatrooms(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>> {
        self.hit().select_user_chatrooms(user_id).await
    }

    async fn store_username(&self, user: &Identity) -> StoreResult<()> {
        self.hit().store_username(user).await
    }
}

pub struct Harness {
    pub db_pool: SqlitePool,
    pub store: Arc<CountingStore>,
    pub directory: Arc<Directory>,
    pub broker: LocalBroker,
}

pub async fn harness() -> Harness {
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let inner = SqliteStore::new(db_pool.clone());
    inner.migrate().await.unwrap();

    let store = Arc::new(CountingStore {
        inner,
        calls: AtomicUsize::new(0),
        fail_inserts: AtomicBool::new(false),
        id_collisions: AtomicUsize::new(0),
        attempted_ids: Mutex::new(Vec::new()),
    });
    Harness {
        db_pool,
        directory: Arc::new(Directory::new(store.clone())),
        store,
        broker: LocalBroker::new(Duration::from_millis(200)),
    }
}

impl Harness {
    pub async fn connect(&self, identity: &Identity) -> (Arc<Session>, DeliveryReceiver) {
        let (session, outbound) =
            Session::open(identity.clone(), &self.broker, self.directory.clone(), 64)
                .await
                .unwrap();
        (Arc::new(session), outbound)
    }

    pub async fn count_chatrooms(&self) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chatrooms")
            .fetch_one(&self.db_pool)
            .await
            .unwrap();
        count
    }
}

pub fn identity(name: &str) -> Identity {
    Identity {
        id: Uuid::now_v7(),
        name: name.to_owned(),
    }
}

pub async fn next_envelope(outbound: &mut DeliveryReceiver) -> Envelope {
    let payload = tokio::time::timeout(Duration::from_secs(2), outbound.recv())
        .await
        .expect("no delivery within 2s")
        .expect("delivery channel closed");
    Envelope::decode(payload.as_bytes()).unwrap()
}

pub async fn next_text(outbound: &mut DeliveryReceiver) -> TextMessage {
    match next_envelope(outbound).await {
        Envelope::Text(msg) => msg,
        other => panic!("expected text, got {other:?}"),
    }
}

pub async fn next_chatroom(outbound: &mut DeliveryReceiver) -> ChatroomMessage {
    match next_envelope(outbound).await {
        Envelope::Chatroom(msg) => msg,
        other => panic!("expected chatroom message, got {other:?}"),
    }
}

/// Consumes the Enter frame and the "entered chat" echo of a fresh join with
/// no history.
pub async fn drain_join(outbound: &mut DeliveryReceiver) -> Uuid {
    let ChatroomMessage::Enter(enter) = next_chatroom(outbound).await else {
        panic!("expected enter");
    };
    let entered = next_text(outbound).await;
    assert_eq!(entered.text, "entered chat");
    enter.chatroom_id
}
