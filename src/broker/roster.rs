use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use uuid::Uuid;

use crate::{
    error::{ChatError, Result},
    models::DeliverySender,
};

type Members = Arc<DashMap<Uuid, DeliverySender>>;

/// Which users are bound to which chatroom, and where their deliveries go.
///
/// Per-chatroom maps are created on first join and kept for the life of the
/// process. Users are removed one chatroom at a time by their session.
#[derive(Default)]
pub struct Roster {
    chatrooms: DashMap<Uuid, Members>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
        delivery: DeliverySender,
    ) -> Result<()> {
        let members = self.chatrooms.entry(chatroom_id).or_default().value().clone();
        match members.entry(user_id) {
            Entry::Occupied(_) => Err(ChatError::DuplicateMember { chatroom_id, user_id }),
            Entry::Vacant(slot) => {
                slot.insert(delivery);
                Ok(())
            }
        }
    }

    pub fn remove_user(&self, chatroom_id: Uuid, user_id: Uuid) {
        if let Some(members) = self.members_of(chatroom_id) {
            members.remove(&user_id);
        }
    }

    pub fn contains(&self, chatroom_id: Uuid, user_id: Uuid) -> bool {
        self.members_of(chatroom_id)
            .is_some_and(|members| members.contains_key(&user_id))
    }

    /// Point-in-time copy of the chatroom's subscribers. No lock is held once
    /// this returns.
    pub fn snapshot(&self, chatroom_id: Uuid) -> Vec<(Uuid, DeliverySender)> {
        let Some(members) = self.members_of(chatroom_id) else {
            return Vec::new();
        };
        members
            .iter()
            .map(|member| (*member.key(), member.value().clone()))
            .collect()
    }

    fn members_of(&self, chatroom_id: Uuid) -> Option<Members> {
        self.chatrooms.get(&chatroom_id).map(|members| members.value().clone())
    }
}
