//! Drives one websocket for its whole life.
//!
//! Five activities share a cancellation token: the write loop, the read loop,
//! the heartbeat, the broker listener and the initial connect. The read loop,
//! the heartbeat and the initial connect cancel everything when they fail.
//! Teardown waits for all five before the user is removed from the broker.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::ws::{Message, WebSocket},
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    sync::{mpsc, Notify},
    time::{timeout, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    config::ConnectionSettings,
    envelope::Envelope,
    error::{ChatError, Result},
    models::{DeliveryReceiver, Identity},
    session::Session,
    AppState,
};

/// Frame sent before closing when the user could not be set up with the broker.
pub const ADD_USER_FAILED: &str = "failed to add user to chatroom";

/// Consecutive transport errors tolerated before the reader gives up.
const MAX_TRANSPORT_ERRORS: usize = 8;
const CONTROL_BUFFER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Entry point for an upgraded socket whose identity has been resolved.
pub async fn serve(socket: WebSocket, identity: Identity, state: AppState) {
    let span = tracing::info_span!(
        "connection",
        user_id = %identity.id,
        user_name = %identity.name
    );

    async move {
        tracing::debug!(state = ?ConnectionState::Connecting);
        let (mut sink, stream) = socket.split();

        let opened = Session::open(
            identity,
            state.broker.as_ref(),
            state.directory.clone(),
            state.settings.delivery_buffer,
        )
        .await;
        let (session, outbound) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                tracing::error!(error = %err, "failed to open broker session");
                let notice = serde_json::json!({ "err": ADD_USER_FAILED }).to_string();
                if let Err(err) = sink.send(Message::Text(notice.into())).await {
                    tracing::debug!(error = %err, "failed to send setup error");
                }
                if let Err(err) = sink.close().await {
                    tracing::debug!(error = %err, "failed to close socket");
                }
                return;
            }
        };

        run(Arc::new(session), outbound, sink, stream, state.settings).await;
    }
    .instrument(span)
    .await
}

/// Runs the five activities over the given socket halves until one of the
/// terminal ones fails, then tears the session down.
pub async fn run<W, R>(
    session: Arc<Session>,
    outbound: DeliveryReceiver,
    sink: W,
    stream: R,
    settings: ConnectionSettings,
) where
    W: Sink<Message, Error = axum::Error> + Send + Unpin + 'static,
    R: Stream<Item = std::result::Result<Message, axum::Error>> + Send + Unpin + 'static,
{
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let pong = Arc::new(Notify::new());
    let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
    let span = tracing::Span::current();

    tracing::info!(state = ?ConnectionState::Active, "connected");

    tracker.spawn(
        write_loop(sink, outbound, control_rx, cancel.clone(), settings.send_timeout)
            .instrument(span.clone()),
    );

    tracker.spawn({
        let session = session.clone();
        let pong = pong.clone();
        let cancel = cancel.clone();
        async move {
            let outcome = read_loop(&session, stream, &pong, &cancel).await;
            match &outcome {
                Ok(()) => {}
                Err(ChatError::Closed(code)) => tracing::info!(?code, "peer closed the connection"),
                Err(err) => tracing::warn!(error = %err, "read loop failed"),
            }
            cancel.cancel();
        }
        .instrument(span.clone())
    });

    tracker.spawn({
        let pong = pong.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(err) = heartbeat(control_tx, &pong, &cancel, settings).await {
                tracing::warn!(error = %err, "heartbeat failed");
                cancel.cancel();
            }
        }
        .instrument(span.clone())
    });

    tracker.spawn({
        let session = session.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(err) = session.listen(cancel).await {
                tracing::error!(error = %err, "broker listener stopped");
            }
        }
        .instrument(span.clone())
    });

    tracker.spawn({
        let session = session.clone();
        let cancel = cancel.clone();
        async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = session.initial_connect() => outcome,
            };
            if let Err(err) = outcome {
                tracing::error!(error = %err, "initial connect failed");
                cancel.cancel();
            }
        }
        .instrument(span)
    });

    tracker.close();
    cancel.cancelled().await;
    tracing::debug!(state = ?ConnectionState::Closing);

    tracker.wait().await;
    session.remove_user().await;
    tracing::info!(state = ?ConnectionState::Closed, "disconnected");
}

/// Writes deliveries and control frames to the socket. A failed write is
/// logged and skipped.
async fn write_loop<W>(
    mut sink: W,
    mut outbound: DeliveryReceiver,
    mut control: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    send_timeout: Duration,
) where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(message) = control.recv() => message,
            payload = outbound.recv() => match payload {
                Some(payload) => Message::Text(payload.into()),
                None => break,
            },
        };

        match timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "failed to write frame"),
            Err(_) => tracing::warn!(timeout = ?send_timeout, "write timed out"),
        }
    }

    if let Ok(Err(err)) = timeout(send_timeout, sink.close()).await {
        tracing::debug!(error = %err, "failed to close socket");
    }
}

async fn read_loop<R>(
    session: &Session,
    mut stream: R,
    pong: &Notify,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
{
    let mut transport_errors = 0;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = stream.next() => frame,
        };

        let message = match frame {
            None => return Err(ChatError::Closed(None)),
            Some(Err(err)) => {
                transport_errors += 1;
                if transport_errors >= MAX_TRANSPORT_ERRORS {
                    return Err(err.into());
                }
                tracing::warn!(error = %err, "transport error");
                continue;
            }
            Some(Ok(message)) => {
                transport_errors = 0;
                message
            }
        };

        let envelope = match message {
            Message::Text(text) => Envelope::decode(text.as_str().as_bytes()),
            Message::Binary(data) => Envelope::decode(&data),
            Message::Pong(_) => {
                signal_pong(pong);
                continue;
            }
            Message::Ping(_) => continue,
            Message::Close(frame) => return Err(ChatError::Closed(frame.map(|frame| frame.code))),
        };

        match envelope {
            Ok(envelope) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = session.dispatch(envelope) => {}
                }
            }
            Err(err) => tracing::warn!(error = %err, "dropping malformed frame"),
        }
    }
}

/// Pings on every interval and fails if the pong does not come back in time.
async fn heartbeat(
    control: mpsc::Sender<Message>,
    pong: &Notify,
    cancel: &CancellationToken,
    settings: ConnectionSettings,
) -> Result<()> {
    let interval = settings.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        // Registered before the ping goes out so a quick pong is not missed.
        let pending = pong.notified();
        tokio::pin!(pending);
        pending.as_mut().enable();

        control
            .send(Message::Ping(Bytes::from_static(b"ping")))
            .await
            .map_err(|_| ChatError::Closed(None))?;

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            answered = timeout(settings.pong_timeout, pending) => {
                answered.map_err(|_| ChatError::HeartbeatTimeout(settings.pong_timeout))?;
            }
        }
    }
}

/// Wakes only a heartbeat already waiting. Pongs that arrive while no ping is
/// outstanding are dropped.
fn signal_pong(pong: &Notify) {
    pong.notify_waiters();
}
