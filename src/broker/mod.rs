//! Fan-out of chatroom traffic to every bound subscriber.
//!
//! A [`Broker`] lives once per process. Every connection opens its own
//! [`BrokerSession`], which binds that user's delivery channel to chatroom
//! topics. Each chatroom has two topics: one for messages and one for
//! presence (join/leave notices).

mod amqp;
mod local;
mod roster;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::{BrokerKind, Config},
    error::Result,
    models::{DeliverySender, Payload, User},
};

pub use amqp::AmqpBroker;
pub use local::LocalBroker;
pub use roster::Roster;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens the per-connection handle for `user`.
    async fn open_session(&self, user: &User) -> Result<Arc<dyn BrokerSession>>;
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Binds the user to the chatroom's message topic.
    async fn join(&self, chatroom_id: Uuid) -> Result<()>;

    /// Binds the user to the chatroom's presence topic.
    async fn join_presence(&self, chatroom_id: Uuid) -> Result<()>;

    /// Unbinds both topics. A no-op for chatrooms never joined.
    async fn leave(&self, chatroom_id: Uuid) -> Result<()>;

    /// Sends `payload` to everyone bound to the chatroom's message topic.
    async fn publish(&self, chatroom_id: Uuid, payload: Payload) -> Result<()>;

    /// Sends `payload` to everyone bound to the chatroom's presence topic.
    async fn publish_presence(&self, chatroom_id: Uuid, payload: Payload) -> Result<()>;

    /// Forwards fanned-out payloads onto `delivery` until `cancel` fires.
    async fn listen(&self, delivery: DeliverySender, cancel: CancellationToken) -> Result<()>;

    /// Releases broker-side resources. Called once at teardown.
    async fn close(&self);
}

/// Builds the strategy selected in `config`. An unreachable exchange is an error.
pub async fn connect(config: &Config) -> Result<Arc<dyn Broker>> {
    let send_timeout = config.connection.send_timeout;
    Ok(match config.broker {
        BrokerKind::Local => {
            tracing::info!("using in-process broker");
            Arc::new(LocalBroker::new(send_timeout))
        }
        BrokerKind::Amqp => {
            Arc::new(AmqpBroker::connect(&config.rabbitmq_url, send_timeout).await?)
        }
    })
}
