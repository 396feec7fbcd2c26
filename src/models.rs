use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::{uuid, Uuid};

use crate::envelope::UserEntry;

/// The reserved chatroom every user falls back to. Can't be renamed or deleted.
pub const MAIN_CHAT_ID: Uuid = uuid!("00000000-0000-0000-0000-000000000001");
pub const MAIN_CHAT_NAME: &str = "mainChat";

/// A serialized envelope headed for one connection.
pub type Payload = String;
pub type DeliverySender = mpsc::Sender<Payload>;
pub type DeliveryReceiver = mpsc::Receiver<Payload>;

/// An authenticated user as handed over by the identity provider, and as the
/// durable store remembers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub name: String,
}

/// A connected user together with its outbound queue.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub delivery: DeliverySender,
}

impl User {
    pub fn new(Identity { id, name }: Identity, delivery: DeliverySender) -> Self {
        Self { id, name, delivery }
    }

    pub fn entry(&self) -> UserEntry {
        UserEntry {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chatroom {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLogEntry {
    pub chatroom_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub text: String,
    pub timestamp: OffsetDateTime,
}

/// Cuts a timestamp down to whole milliseconds, the resolution the store keeps.
pub fn standardize_time(t: OffsetDateTime) -> OffsetDateTime {
    let nanos = t.nanosecond();
    t.replace_nanosecond(nanos - nanos % 1_000_000).unwrap_or(t)
}

pub fn now() -> OffsetDateTime {
    standardize_time(OffsetDateTime::now_utc())
}

pub(crate) fn unix_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_unix_millis(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
