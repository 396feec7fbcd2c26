use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeliverySender, Payload, User},
};

use super::{Broker, BrokerSession, Roster};

struct Registry {
    messages: Roster,
    presence: Roster,
    send_timeout: Duration,
}

impl Registry {
    /// Sends to every subscriber at once so one full queue only delays itself.
    async fn fan_out(&self, roster: &Roster, chatroom_id: Uuid, payload: Payload) {
        let subscribers = roster.snapshot(chatroom_id);
        tracing::trace!(%chatroom_id, subscribers = subscribers.len(), "fanning out");

        let send_timeout = self.send_timeout;
        join_all(subscribers.into_iter().map(|(user_id, delivery)| {
            let payload = payload.clone();
            async move {
                if let Err(err) = delivery.send_timeout(payload, send_timeout).await {
                    tracing::warn!(%chatroom_id, %user_id, error = %err, "dropped delivery");
                }
            }
        }))
        .await;
    }
}

/// Single-node broker: chatroom topics are rosters of delivery channels held
/// in this process.
#[derive(Clone)]
pub struct LocalBroker {
    registry: Arc<Registry>,
}

impl LocalBroker {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Registry {
                messages: Roster::new(),
                presence: Roster::new(),
                send_timeout,
            }),
        }
    }

    /// Whether `user_id` is currently bound to the chatroom's message topic.
    pub fn is_member(&self, chatroom_id: Uuid, user_id: Uuid) -> bool {
        self.registry.messages.contains(chatroom_id, user_id)
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn open_session(&self, user: &User) -> Result<Arc<dyn BrokerSession>> {
        Ok(Arc::new(LocalSession {
            registry: self.registry.clone(),
            user_id: user.id,
            delivery: user.delivery.clone(),
        }))
    }
}

struct LocalSession {
    registry: Arc<Registry>,
    user_id: Uuid,
    delivery: DeliverySender,
}

#[async_trait]
impl BrokerSession for LocalSession {
    async fn join(&self, chatroom_id: Uuid) -> Result<()> {
        self.registry
            .messages
            .add_user(chatroom_id, self.user_id, self.delivery.clone())
    }

    async fn join_presence(&self, chatroom_id: Uuid) -> Result<()> {
        self.registry
            .presence
            .add_user(chatroom_id, self.user_id, self.delivery.clone())
    }

    async fn leave(&self, chatroom_id: Uuid) -> Result<()> {
        self.registry.messages.remove_user(chatroom_id, self.user_id);
        self.registry.presence.remove_user(chatroom_id, self.user_id);
        Ok(())
    }

    async fn publish(&self, chatroom_id: Uuid, payload: Payload) -> Result<()> {
        self.registry
            .fan_out(&self.registry.messages, chatroom_id, payload)
            .await;
        Ok(())
    }

    async fn publish_presence(&self, chatroom_id: Uuid, payload: Payload) -> Result<()> {
        self.registry
            .fan_out(&self.registry.presence, chatroom_id, payload)
            .await;
        Ok(())
    }

    async fn listen(&self, _delivery: DeliverySender, cancel: CancellationToken) -> Result<()> {
        // Publishers write straight into the roster's channels.
        cancel.cancelled().await;
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{error::ChatError, models::Identity};

    fn user(name: &str, buffer: usize) -> (User, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(buffer);
        let identity = Identity { id: Uuid::now_v7(), name: name.to_owned() };
        (User::new(identity, tx), rx)
    }

    #[tokio::test]
    async fn publish_reaches_only_bound_users() {
        let broker = LocalBroker::new(Duration::from_secs(1));
        let room = Uuid::now_v7();
        let other_room = Uuid::now_v7();
        let (ann, mut ann_rx) = user("ann", 4);
        let (bo, mut bo_rx) = user("bo", 4);
        let (cy, mut cy_rx) = user("cy", 4);

        let ann_session = broker.open_session(&ann).await.unwrap();
        let bo_session = broker.open_session(&bo).await.unwrap();
        let cy_session = broker.open_session(&cy).await.unwrap();
        ann_session.join(room).await.unwrap();
        bo_session.join(room).await.unwrap();
        cy_session.join(other_room).await.unwrap();

        ann_session.publish(room, "hello".to_owned()).await.unwrap();

        assert_eq!(ann_rx.recv().await.unwrap(), "hello");
        assert_eq!(bo_rx.recv().await.unwrap(), "hello");
        assert!(cy_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn presence_is_a_separate_topic() {
        let broker = LocalBroker::new(Duration::from_secs(1));
        let room = Uuid::now_v7();
        let (ann, mut ann_rx) = user("ann", 4);
        let (bo, mut bo_rx) = user("bo", 4);

        let ann_session = broker.open_session(&ann).await.unwrap();
        let bo_session = broker.open_session(&bo).await.unwrap();
        ann_session.join(room).await.unwrap();
        bo_session.join(room).await.unwrap();
        bo_session.join_presence(room).await.unwrap();

        ann_session.publish_presence(room, "ann is here".to_owned()).await.unwrap();

        assert_eq!(bo_rx.recv().await.unwrap(), "ann is here");
        assert!(ann_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_the_rest() {
        let broker = LocalBroker::new(Duration::from_millis(50));
        let room = Uuid::now_v7();
        let (ann, mut ann_rx) = user("ann", 4);
        let (slow, _slow_rx) = user("slow", 1);

        let ann_session = broker.open_session(&ann).await.unwrap();
        let slow_session = broker.open_session(&slow).await.unwrap();
        ann_session.join(room).await.unwrap();
        slow_session.join(room).await.unwrap();

        // Fills the slow queue, then the second publish times out for it only.
        ann_session.publish(room, "one".to_owned()).await.unwrap();
        ann_session.publish(room, "two".to_owned()).await.unwrap();

        assert_eq!(ann_rx.recv().await.unwrap(), "one");
        assert_eq!(ann_rx.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn leave_is_safe_and_rejoin_works() {
        let broker = LocalBroker::new(Duration::from_secs(1));
        let room = Uuid::now_v7();
        let (ann, _ann_rx) = user("ann", 4);
        let session = broker.open_session(&ann).await.unwrap();

        session.leave(room).await.unwrap();
        session.join(room).await.unwrap();
        assert!(matches!(session.join(room).await, Err(ChatError::DuplicateMember { .. })));

        session.leave(room).await.unwrap();
        assert!(!broker.is_member(room, ann.id));
        session.join(room).await.unwrap();
        assert!(broker.is_member(room, ann.id));
    }
}
