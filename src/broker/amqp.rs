use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{ChatError, Result},
    models::{DeliverySender, Payload, User},
};

use super::{Broker, BrokerSession};

/// Topic exchange shared by every node.
pub const EXCHANGE: &str = "chatrooms";
const PRESENCE_SUFFIX: &str = ".presence";
const REPLY_SUCCESS: u16 = 200;
const REQUEUE: BasicNackOptions = BasicNackOptions {
    multiple: false,
    requeue: true,
};

fn message_key(chatroom_id: Uuid) -> String {
    chatroom_id.to_string()
}

fn presence_key(chatroom_id: Uuid) -> String {
    format!("{chatroom_id}{PRESENCE_SUFFIX}")
}

/// Broker backed by an AMQP topic exchange, for fan-out across processes.
///
/// Each session gets its own channel and an exclusive, auto-deleted queue
/// bound to the routing keys of the chatrooms it joined.
pub struct AmqpBroker {
    connection: Connection,
    send_timeout: Duration,
}

impl AmqpBroker {
    pub async fn connect(url: &str, send_timeout: Duration) -> Result<Self> {
        tracing::info!("connecting to message exchange");

        let options = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = Connection::connect(url, options).await?;

        let channel = connection.create_channel().await?;
        channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel.close(REPLY_SUCCESS, "exchange declared").await?;

        tracing::info!(exchange = EXCHANGE, "message exchange ready");
        Ok(Self { connection, send_timeout })
    }

    pub async fn close(&self) {
        if let Err(err) = self.connection.close(REPLY_SUCCESS, "shutting down").await {
            tracing::warn!(error = %err, "failed to close exchange connection");
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_session(&self, user: &User) -> Result<Arc<dyn BrokerSession>> {
        let channel = self.connection.create_channel().await?;
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        tracing::debug!(
            user_id = %user.id,
            queue = queue.name().as_str(),
            "declared session queue"
        );

        Ok(Arc::new(AmqpSession {
            channel,
            queue: queue.name().as_str().to_owned(),
            user_id: user.id,
            send_timeout: self.send_timeout,
        }))
    }
}

struct AmqpSession {
    channel: Channel,
    queue: String,
    user_id: Uuid,
    send_timeout: Duration,
}

impl AmqpSession {
    async fn bind(&self, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                &self.queue,
                EXCHANGE,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn unbind(&self, routing_key: &str) -> Result<()> {
        self.channel
            .queue_unbind(&self.queue, EXCHANGE, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn send(&self, chatroom_id: Uuid, routing_key: &str, payload: Payload) -> Result<()> {
        let publish = async {
            self.channel
                .basic_publish(
                    EXCHANGE,
                    routing_key,
                    BasicPublishOptions::default(),
                    payload.as_bytes(),
                    BasicProperties::default().with_content_type("application/json".into()),
                )
                .await?
                .await?;
            Ok::<_, ChatError>(())
        };

        tokio::time::timeout(self.send_timeout, publish)
            .await
            .map_err(|_| ChatError::PublishTimeout(chatroom_id))?
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn join(&self, chatroom_id: Uuid) -> Result<()> {
        self.bind(&message_key(chatroom_id)).await
    }

    async fn join_presence(&self, chatroom_id: Uuid) -> Result<()> {
        self.bind(&presence_key(chatroom_id)).await
    }

    async fn leave(&self, chatroom_id: Uuid) -> Result<()> {
        // Unbinding a key that was never bound is accepted by the server.
        self.unbind(&message_key(chatroom_id)).await?;
        self.unbind(&presence_key(chatroom_id)).await
    }

    async fn publish(&self, chatroom_id: Uuid, payload: Payload) -> Result<()> {
        self.send(chatroom_id, &message_key(chatroom_id), payload).await
    }

    async fn publish_presence(&self, chatroom_id: Uuid, payload: Payload) -> Result<()> {
        self.send(chatroom_id, &presence_key(chatroom_id), payload).await
    }

    /// Acks a delivery only once it sits in the session's delivery channel,
    /// so a crash before hand-off gets it redelivered.
    async fn listen(&self, delivery: DeliverySender, cancel: CancellationToken) -> Result<()> {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &format!("session-{}", self.user_id),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = consumer.next() => match next {
                    Some(incoming) => incoming?,
                    None => return Ok(()),
                },
            };

            let payload = match String::from_utf8(incoming.data.clone()) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(error = %err, "discarding non-utf8 delivery");
                    incoming.acker.reject(BasicRejectOptions { requeue: false }).await?;
                    continue;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    incoming.acker.nack(REQUEUE).await?;
                    return Ok(());
                }
                sent = delivery.send(payload) => {
                    if sent.is_err() {
                        incoming.acker.nack(REQUEUE).await?;
                        return Err(ChatError::DeliveryClosed);
                    }
                    incoming.acker.ack(BasicAckOptions::default()).await?;
                }
            }
        }
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close(REPLY_SUCCESS, "session closed").await {
            tracing::warn!(
                user_id = %self.user_id,
                error = %err,
                "failed to close session channel"
            );
        }
    }
}
