use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    broker::{Broker, BrokerSession},
    directory::{self, Directory},
    envelope::{
        ChatroomMessage, CreateChatroom, Envelope, TextMessage, UpdateChatroom, UserPresence,
    },
    error::{ChatError, Result},
    models::{DeliveryReceiver, Identity, Payload, User, MAIN_CHAT_ID},
};

/// Server-side state of one live connection: who is connected, where their
/// deliveries go and which chatrooms they have joined.
pub struct Session {
    user: User,
    broker: Arc<dyn BrokerSession>,
    directory: Arc<Directory>,
    joined: DashSet<Uuid>,
}

impl Session {
    /// Creates the delivery channel and opens the user's broker handle. The
    /// receiving half goes to whoever writes to the connection.
    pub async fn open(
        identity: Identity,
        broker: &dyn Broker,
        directory: Arc<Directory>,
        delivery_buffer: usize,
    ) -> Result<(Self, DeliveryReceiver)> {
        let (delivery, outbound) = mpsc::channel(delivery_buffer);
        let user = User::new(identity, delivery);
        let broker = broker.open_session(&user).await?;

        let session = Self {
            user,
            broker,
            directory,
            joined: DashSet::new(),
        };
        Ok((session, outbound))
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Chatrooms this session is currently bound to.
    pub fn joined(&self) -> Vec<Uuid> {
        self.joined.iter().map(|id| *id).collect()
    }

    /// Stamps the sender and the time onto `msg`, stores it, then fans it out.
    /// A message without a chatroom goes to the main chat.
    pub async fn send_message(&self, msg: TextMessage) -> Result<()> {
        let chatroom_id = if msg.chatroom_id.is_nil() { MAIN_CHAT_ID } else { msg.chatroom_id };
        self.directory
            .post_text(&self.user, self.broker.as_ref(), chatroom_id, msg.text)
            .await
    }

    /// Queues a payload for this connection only, bypassing the broker.
    pub async fn receive_envelope(&self, payload: Payload) -> Result<()> {
        self.user
            .delivery
            .send(payload)
            .await
            .map_err(|_| ChatError::DeliveryClosed)
    }

    /// Runs the join sequence. The chatroom is tracked before the sequence
    /// starts, so a join dropped midway by teardown is still unbound.
    pub async fn enter_chatroom(&self, chatroom_id: Uuid) -> Result<()> {
        let tracked = self.joined.insert(chatroom_id);
        let entered = self
            .directory
            .enter_chatroom(&self.user, self.broker.as_ref(), chatroom_id)
            .await;
        // A failed sequence has already unbound itself, or never bound.
        if entered.is_err() && tracked {
            self.joined.remove(&chatroom_id);
        }
        entered
    }

    /// Creates the chatroom and enters it.
    pub async fn create_chatroom(&self, create: &CreateChatroom) -> Result<Uuid> {
        let invite_users = directory::parse_user_ids(&create.invite_users);
        let chatroom_id = self
            .directory
            .create_chatroom(&create.name, &invite_users)
            .await?;
        self.enter_chatroom(chatroom_id).await?;
        Ok(chatroom_id)
    }

    pub async fn update_chatroom(&self, update: &UpdateChatroom) -> Result<()> {
        self.directory
            .update_chatroom(self.broker.as_ref(), update)
            .await
    }

    pub async fn delete_chatroom(&self, chatroom_id: Uuid) -> Result<()> {
        self.directory
            .delete_chatroom(self.broker.as_ref(), chatroom_id)
            .await?;
        if self.joined.remove(&chatroom_id).is_some() {
            self.broker.leave(chatroom_id).await?;
        }
        Ok(())
    }

    /// Remembers the user's name, then enters every chatroom they belong to,
    /// or the main chat if none. Any failed enter fails the whole connect.
    pub async fn initial_connect(&self) -> Result<()> {
        let identity = Identity {
            id: self.user.id,
            name: self.user.name.clone(),
        };
        if let Err(err) = self.directory.store().store_username(&identity).await {
            tracing::warn!(error = %err, "failed to store username");
        }

        let mut chatrooms = self.directory.list_memberships(self.user.id).await?;
        if chatrooms.is_empty() {
            chatrooms.push(MAIN_CHAT_ID);
        }
        tracing::debug!(chatrooms = chatrooms.len(), "initial connect");

        for chatroom_id in chatrooms {
            self.enter_chatroom(chatroom_id).await?;
        }
        Ok(())
    }

    /// Pumps broker deliveries into this session's channel until cancelled.
    pub async fn listen(&self, cancel: CancellationToken) -> Result<()> {
        self.broker.listen(self.user.delivery.clone(), cancel).await
    }

    /// Tells every joined chatroom the user left, unbinds from all of them and
    /// releases the broker handle.
    pub async fn remove_user(&self) {
        for chatroom_id in self.joined() {
            let departure = Envelope::from(ChatroomMessage::RemoveUser(UserPresence {
                chatroom_id,
                user: self.user.entry(),
            }));
            if let Err(err) = self.leave(chatroom_id, departure).await {
                tracing::warn!(%chatroom_id, error = %err, "failed to leave chatroom");
            }
        }
        self.broker.close().await;
    }

    async fn leave(&self, chatroom_id: Uuid, departure: Envelope) -> Result<()> {
        self.joined.remove(&chatroom_id);
        self.broker.leave(chatroom_id).await?;
        self.broker.publish_presence(chatroom_id, departure.encode()?).await
    }

    /// Routes one inbound envelope to its handler. Failures are logged and
    /// never end the connection.
    pub async fn dispatch(&self, envelope: Envelope) {
        let outcome = match envelope {
            Envelope::Text(msg) => self.send_message(msg).await,
            Envelope::Chatroom(ChatroomMessage::Create(create)) => {
                self.create_chatroom(&create).await.map(|_| ())
            }
            Envelope::Chatroom(ChatroomMessage::Update(update)) => {
                self.update_chatroom(&update).await
            }
            Envelope::Chatroom(ChatroomMessage::Delete(delete)) => {
                self.delete_chatroom(delete.chatroom_id).await
            }
            Envelope::Chatroom(other) => {
                tracing::debug!(request = ?other, "ignoring server-only chatroom message");
                Ok(())
            }
        };

        if let Err(err) = outcome {
            tracing::warn!(error = %err, "request failed");
        }
    }
}
