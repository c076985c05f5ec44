//! Socket session: pumps one upgraded `WebSocket` through its broker, from
//! upgrade through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::histogram;
use rtm_protocol::CloseCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use super::broker::ConnectionBroker;
use super::connection::{ClientConnection, Outbound};
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::metrics::CONNECTION_DURATION_SECONDS;

/// How long the peer has to answer a close frame before the socket is dropped.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_CAPACITY: usize = 1024;

/// Liveness settings for one session.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// Ping interval.
    pub heartbeat_interval: Duration,
    /// Disconnect after this long without inbound frames.
    pub idle_timeout: Duration,
}

/// Run a `WebSocket` session for an accepted client.
///
/// 1. Spawns the write task draining the connection's outbound queue
/// 2. Spawns the heartbeat, which hard-disconnects idle clients
/// 3. Admits the connection (`hello`, or a refusal close frame)
/// 4. Feeds inbound frames to the broker until the socket ends
/// 5. Runs the broker's close sequence
pub async fn run_ws_session(
    ws: WebSocket,
    broker: Arc<ConnectionBroker>,
    outbound: mpsc::Receiver<Outbound>,
    config: SessionConfig,
) {
    let span = info_span!("rtm.session", client_id = %broker.client_id());
    session(ws, broker, outbound, config).instrument(span).await;
}

async fn session(
    ws: WebSocket,
    broker: Arc<ConnectionBroker>,
    outbound: mpsc::Receiver<Outbound>,
    config: SessionConfig,
) {
    let started = Instant::now();
    let connection = Arc::clone(broker.connection());
    let (ws_tx, mut ws_rx) = ws.split();

    let writer = tokio::spawn(write_loop(ws_tx, outbound, Arc::clone(&connection)));

    let heartbeat_cancel = CancellationToken::new();
    let heartbeat = tokio::spawn({
        let connection = Arc::clone(&connection);
        let cancel = heartbeat_cancel.clone();
        async move {
            let result = run_heartbeat(
                Arc::clone(&connection),
                config.heartbeat_interval,
                config.idle_timeout,
                cancel,
            )
            .await;
            if result == HeartbeatResult::TimedOut {
                warn!(
                    client_id = %connection.client_id(),
                    idle_secs = connection.idle_for().as_secs(),
                    "client idle too long, disconnecting"
                );
                connection.disconnect();
            }
        }
    });

    if let Err(e) = broker.initialise() {
        debug!(error = %e, "connection not admitted");
    }

    loop {
        let frame = tokio::select! {
            () = connection.disconnected() => break,
            frame = ws_rx.next() => frame,
        };
        let Some(frame) = frame else { break };
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                broker.on_transport_error(&e);
                break;
            }
        };
        connection.mark_alive();
        match message {
            Message::Text(text) => broker.on_text(text.as_str()).await,
            Message::Binary(data) => broker.on_binary(data.len()),
            // The next read flushes the close reply and ends the stream.
            Message::Close(frame) => debug!(?frame, "client sent close frame"),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    heartbeat_cancel.cancel();
    broker.on_close().await;
    connection.disconnect();
    let _ = writer.await;
    let _ = heartbeat.await;
    histogram!(CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    connection: Arc<ClientConnection>,
) {
    loop {
        let item = tokio::select! {
            () = connection.disconnected() => break,
            item = outbound.recv() => item,
        };
        let Some(item) = item else { break };
        let message = match item {
            Outbound::Text(text) => Message::Text(text.as_str().into()),
            Outbound::Ping => Message::Ping(Bytes::new()),
            Outbound::Close { code, reason } => {
                send_close(&mut ws_tx, code, reason).await;
                tokio::select! {
                    () = connection.disconnected() => {}
                    () = tokio::time::sleep(CLOSE_GRACE) => {
                        debug!(client_id = %connection.client_id(), "close handshake not completed, dropping socket");
                        connection.disconnect();
                    }
                }
                break;
            }
        };
        if ws_tx.send(message).await.is_err() {
            connection.disconnect();
            break;
        }
    }
}

async fn send_close(ws_tx: &mut SplitSink<WebSocket, Message>, code: CloseCode, reason: String) {
    let frame = CloseFrame {
        code: code.as_u16(),
        reason: reason.into(),
    };
    if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "failed to send close frame");
    }
}

/// Close a freshly upgraded socket without admitting it.
pub async fn reject(mut ws: WebSocket, code: CloseCode, reason: String) {
    let frame = CloseFrame {
        code: code.as_u16(),
        reason: reason.into(),
    };
    if ws.send(Message::Close(Some(frame))).await.is_err() {
        return;
    }
    let drain = async { while let Some(Ok(_)) = ws.recv().await {} };
    let _ = tokio::time::timeout(CLOSE_GRACE, drain).await;
}

