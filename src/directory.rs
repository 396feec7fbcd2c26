use std::sync::Arc;

use uuid::Uuid;

use crate::{
    broker::BrokerSession,
    envelope::{
        ChatroomMessage, DeleteChatroom, EnterChatroom, Envelope, UpdateChatroom, UserEntry,
        UserPresence,
    },
    error::{ChatError, Result},
    models::{self, ChatLogEntry, Chatroom, Payload, User, MAIN_CHAT_ID},
    store::{ChatroomStore, StoreError},
};

/// Text posted on behalf of a user when they enter a chatroom.
pub const ENTERED_CHAT: &str = "entered chat";

/// Chatroom metadata, membership and history on top of the durable store.
pub struct Directory {
    store: Arc<dyn ChatroomStore>,
}

impl Directory {
    pub fn new(store: Arc<dyn ChatroomStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ChatroomStore> {
        &self.store
    }

    /// Creates a chatroom and returns its fresh id. Id clashes are retried
    /// with a new id, name clashes are an error.
    pub async fn create_chatroom(&self, name: &str, invite_users: &[Uuid]) -> Result<Uuid> {
        if name.trim().is_empty() {
            return Err(ChatError::EmptyName);
        }

        let chatroom_id = loop {
            let candidate = Uuid::now_v7();
            match self.store.create_chatroom(candidate, name).await {
                Ok(()) => break candidate,
                Err(StoreError::IdCollision(_)) => {
                    tracing::debug!(chatroom_id = %candidate, "chatroom id taken, regenerating");
                }
                Err(StoreError::NameTaken(name)) => return Err(ChatError::NameTaken(name)),
                Err(err) => return Err(err.into()),
            }
        };
        tracing::info!(%chatroom_id, name, "created chatroom");

        for &user_id in invite_users {
            if let Err(err) = self.record_membership(user_id, chatroom_id).await {
                tracing::warn!(%chatroom_id, %user_id, error = %err, "failed to invite user");
            }
        }

        Ok(chatroom_id)
    }

    /// Renames a chatroom and tells its members.
    pub async fn update_chatroom(
        &self,
        broker: &dyn BrokerSession,
        update: &UpdateChatroom,
    ) -> Result<()> {
        let chatroom_id = update.chatroom_id;
        if chatroom_id == MAIN_CHAT_ID {
            return Err(ChatError::ReservedChatroom(chatroom_id));
        }
        if update.new_name.trim().is_empty() {
            return Err(ChatError::EmptyName);
        }

        let add_users = parse_user_ids(&update.invite_users);
        let remove_users = parse_user_ids(&update.remove_users);
        self.store
            .update_chatroom(chatroom_id, &update.new_name, &add_users, &remove_users)
            .await
            .map_err(|err| not_found_as(err, chatroom_id))?;
        tracing::info!(%chatroom_id, name = %update.new_name, "renamed chatroom");

        let notice = Envelope::from(ChatroomMessage::Update(UpdateChatroom {
            chatroom_id,
            new_name: update.new_name.clone(),
            invite_users: Vec::new(),
            remove_users: Vec::new(),
        }));
        broker.publish(chatroom_id, notice.encode()?).await
    }

    /// Deletes a chatroom's metadata and tells its members.
    pub async fn delete_chatroom(
        &self,
        broker: &dyn BrokerSession,
        chatroom_id: Uuid,
    ) -> Result<()> {
        if chatroom_id == MAIN_CHAT_ID {
            return Err(ChatError::ReservedChatroom(chatroom_id));
        }

        self.store
            .delete_chatroom(chatroom_id)
            .await
            .map_err(|err| not_found_as(err, chatroom_id))?;
        tracing::info!(%chatroom_id, "deleted chatroom");

        let notice = Envelope::from(ChatroomMessage::Delete(DeleteChatroom { chatroom_id }));
        broker.publish(chatroom_id, notice.encode()?).await
    }

    /// Runs the join sequence for `user`.
    ///
    /// The joining user sees the chatroom info first, then the whole backlog,
    /// then live traffic. Both of the former go straight onto the user's own
    /// delivery channel before the arrival is announced to anyone.
    pub async fn enter_chatroom(
        &self,
        user: &User,
        broker: &dyn BrokerSession,
        chatroom_id: Uuid,
    ) -> Result<()> {
        tracing::info!(%chatroom_id, "entering chatroom");
        broker.join(chatroom_id).await?;

        if let Err(err) = self.enter_joined(user, broker, chatroom_id).await {
            if let Err(leave_err) = broker.leave(chatroom_id).await {
                tracing::warn!(
                    %chatroom_id,
                    error = %leave_err,
                    "failed to unbind after aborted join"
                );
            }
            return Err(err);
        }
        Ok(())
    }

    async fn enter_joined(
        &self,
        user: &User,
        broker: &dyn BrokerSession,
        chatroom_id: Uuid,
    ) -> Result<()> {
        let chatroom = self.chatroom(chatroom_id).await?;

        if let Err(err) = self.record_membership(user.id, chatroom_id).await {
            tracing::warn!(%chatroom_id, error = %err, "failed to record membership");
        }

        let user_list = self
            .store
            .select_chatroom_users(chatroom_id)
            .await?
            .into_iter()
            .map(|member| UserEntry { name: member.name, id: member.id })
            .collect();
        let enter = Envelope::from(ChatroomMessage::Enter(EnterChatroom {
            chatroom_name: chatroom.name,
            chatroom_id,
            user_list,
        }));
        deliver_private(user, enter.encode()?).await?;

        let backlog = self.store.select_chatroom_logs(chatroom_id).await?;
        tracing::debug!(%chatroom_id, entries = backlog.len(), "replaying history");
        for entry in backlog {
            deliver_private(user, Envelope::Text(entry.into()).encode()?).await?;
        }

        let arrival = Envelope::from(ChatroomMessage::AddUser(UserPresence {
            chatroom_id,
            user: user.entry(),
        }));
        if let Err(err) = broker.publish_presence(chatroom_id, arrival.encode()?).await {
            tracing::warn!(%chatroom_id, error = %err, "failed to announce arrival");
        }
        broker.join_presence(chatroom_id).await?;

        if let Err(err) = self.post_text(user, broker, chatroom_id, ENTERED_CHAT.to_owned()).await {
            tracing::warn!(%chatroom_id, error = %err, "failed to post entry message");
        }
        Ok(())
    }

    /// Persists a text message from `user`, then fans it out. Nothing is
    /// published if the write fails.
    pub async fn post_text(
        &self,
        user: &User,
        broker: &dyn BrokerSession,
        chatroom_id: Uuid,
        text: String,
    ) -> Result<()> {
        let entry = ChatLogEntry {
            chatroom_id,
            user_id: user.id,
            user_name: user.name.clone(),
            text,
            timestamp: models::now(),
        };
        self.store.insert_chatroom_log(&entry).await?;

        broker.publish(chatroom_id, Envelope::Text(entry.into()).encode()?).await
    }

    pub async fn record_membership(&self, user_id: Uuid, chatroom_id: Uuid) -> Result<()> {
        Ok(self.store.add_user_to_chatroom(chatroom_id, user_id).await?)
    }

    pub async fn list_memberships(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self.store.select_user_chatrooms(user_id).await?)
    }

    /// Active chatroom by id.
    pub async fn chatroom(&self, chatroom_id: Uuid) -> Result<Chatroom> {
        let chatroom = self
            .store
            .select_chatroom_entry(chatroom_id)
            .await
            .map_err(|err| not_found_as(err, chatroom_id))?;
        if !chatroom.is_active {
            return Err(ChatError::ChatroomNotFound(chatroom_id));
        }
        Ok(chatroom)
    }
}

async fn deliver_private(user: &User, payload: Payload) -> Result<()> {
    user.delivery
        .send(payload)
        .await
        .map_err(|_| ChatError::DeliveryClosed)
}

fn not_found_as(err: StoreError, chatroom_id: Uuid) -> ChatError {
    match err {
        StoreError::NotFound(_) => ChatError::ChatroomNotFound(chatroom_id),
        StoreError::NameTaken(name) => ChatError::NameTaken(name),
        err => err.into(),
    }
}

/// Wire user ids are plain strings; malformed ones are skipped.
pub(crate) fn parse_user_ids(raw: &[String]) -> Vec<Uuid> {
    raw.iter()
        .filter_map(|id| match Uuid::parse_str(id) {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(user_id = %id, error = %err, "ignoring malformed user id");
                None
            }
        })
        .collect()
}
