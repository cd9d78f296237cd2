use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use crate::constants::KEEPALIVE_INTERVAL_SECS;
use crate::protocol::{ClientRequest, Envelope, SyncMessage, VIDEO_SYNC};
use crate::utils::current_unix_millis;

type MessageHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Fire-and-forget message channel over a WebSocket.
///
/// Cheap to clone; every clone talks to the same socket. Handlers registered
/// with [`SyncChannel::on_message`] are kept across reconnects.
#[derive(Clone)]
pub struct SyncChannel {
    inner: Arc<ChannelState>,
}

struct ChannelState {
    transport: Mutex<Option<Transport>>,
    next_transport_id: AtomicU64,
    handlers: Mutex<Vec<MessageHandler>>,
    stats: Mutex<ChannelStats>,
}

struct Transport {
    id: u64,
    tx: mpsc::UnboundedSender<WsMessage>,
}

#[derive(Default, Clone)]
struct ChannelStats {
    bytes_out: u64,
    bytes_in: u64,
    messages_out: u64,
    messages_in: u64,
    dropped_out: u64,
    last_message_at: Option<Instant>,
    last_ping_sent: Option<Instant>,
    last_ping_nonce: Option<u64>,
    last_rtt_ms: Option<f32>,
    last_disconnect_at: Option<Instant>,
    reconnect_attempts: u32,
    connected_since: Option<Instant>,
    endpoint_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatsSnapshot {
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub messages_out: u64,
    pub messages_in: u64,
    pub dropped_out: u64,
    pub last_rtt_ms: Option<f32>,
    pub last_message_age: Option<f32>,
    pub connected_duration: Option<f32>,
    pub reconnect_attempts: u32,
    pub endpoint_label: Option<String>,
    pub last_disconnect_secs: Option<f32>,
}

impl Default for SyncChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncChannel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChannelState {
                transport: Mutex::new(None),
                next_transport_id: AtomicU64::new(1),
                handlers: Mutex::new(Vec::new()),
                stats: Mutex::new(ChannelStats::default()),
            }),
        }
    }

    /// Connect to the relay. Returns a receiver that resolves when the socket closes.
    pub async fn connect(&self, url: &str) -> Result<oneshot::Receiver<()>> {
        let (ws_stream, _) = connect_async(url)
            .await
            .context("Failed to connect to server")?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let transport_id = self.inner.next_transport_id.fetch_add(1, Ordering::Relaxed);
        let keepalive_tx = tx.downgrade();
        if let Some(previous) = self.inner.transport.lock().replace(Transport {
            id: transport_id,
            tx,
        }) {
            let _ = previous.tx.send(WsMessage::Close(None));
        }

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let disconnect_signal = Arc::new(Mutex::new(Some(disconnect_tx)));

        // Sender task
        let send_inner = Arc::clone(&self.inner);
        let send_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if ws_sender.send(msg).await.is_err() || closing {
                    break;
                }
            }
            send_inner.clear_transport(transport_id);
            if let Some(tx) = send_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        let recv_inner = Arc::clone(&self.inner);
        let recv_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        recv_inner.record_incoming(text.len() as u64);
                        match serde_json::from_str::<Envelope>(text.as_str()) {
                            Ok(envelope) => recv_inner.dispatch(envelope),
                            Err(e) => tracing::debug!("Ignoring malformed frame: {}", e),
                        }
                    }
                    Ok(WsMessage::Pong(payload)) => {
                        recv_inner.handle_ws_pong(&payload);
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        tracing::debug!("Socket read failed: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            recv_inner.clear_transport(transport_id);
            if let Some(tx) = recv_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        // Keep-alive pings; stops once this transport's writer is gone
        let ping_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(KEEPALIVE_INTERVAL_SECS)).await;
                let Some(tx) = keepalive_tx.upgrade() else {
                    break;
                };
                if ping_inner.send_keepalive(&tx).is_err() {
                    break;
                }
            }
        });

        Ok(disconnect_rx)
    }

    /// Register a handler for every inbound message, whatever its type
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.inner.handlers.lock().push(Arc::new(handler));
    }

    /// Only meaningful for display; sends never wait on it
    pub fn is_connected(&self) -> bool {
        self.inner.transport.lock().is_some()
    }

    /// Close the current socket, if any. Handlers stay registered.
    pub fn disconnect(&self) {
        if let Some(transport) = self.inner.transport.lock().take() {
            let _ = transport.tx.send(WsMessage::Close(None));
        }
    }

    pub fn mark_connected(&self, label: &str) {
        self.inner.mark_connected(label);
    }

    pub fn mark_disconnected(&self) {
        self.inner.mark_disconnected();
    }

    pub fn stats_snapshot(&self) -> ChannelStatsSnapshot {
        self.inner.snapshot()
    }

    pub fn send_request(&self, request: &ClientRequest) -> Result<()> {
        self.send_message(request.kind(), request, None)
    }

    pub fn send_sync(&self, room_id: &str, message: &SyncMessage) -> Result<()> {
        self.send_message(VIDEO_SYNC, message, Some(room_id))
    }

    /// Queue a message for the socket.
    ///
    /// Only serialization failures are errors. While disconnected the
    /// message is dropped.
    pub fn send_message<T: Serialize>(
        &self,
        kind: &str,
        payload: &T,
        room_id: Option<&str>,
    ) -> Result<()> {
        let envelope = Envelope::new(kind, payload, room_id)
            .with_context(|| format!("Failed to encode `{kind}` payload"))?;
        let json = serde_json::to_string(&envelope).context("Failed to serialize message")?;
        let len = json.len() as u64;
        match self.inner.enqueue_ws(WsMessage::Text(json.into())) {
            Ok(()) => self.inner.record_outgoing(len),
            Err(()) => {
                self.inner.stats.lock().dropped_out += 1;
                tracing::debug!("Dropping `{}` while disconnected", kind);
            }
        }
        Ok(())
    }
}

impl ChannelState {
    fn dispatch(&self, envelope: Envelope) {
        let handlers: Vec<MessageHandler> = self.handlers.lock().clone();
        for handler in handlers {
            handler(envelope.clone());
        }
    }

    fn record_outgoing(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_out += bytes;
        stats.messages_out += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn record_incoming(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_in += bytes;
        stats.messages_in += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn handle_ws_pong(&self, payload: &[u8]) {
        self.record_incoming(payload.len() as u64);
        let Some(nonce_bytes) = payload.get(..8) else {
            return;
        };
        let mut buf = [0u8; 8];
        buf.copy_from_slice(nonce_bytes);
        self.record_pong(u64::from_le_bytes(buf));
    }

    fn record_pong(&self, nonce: u64) {
        let mut stats = self.stats.lock();
        if stats.last_ping_nonce == Some(nonce) {
            if let Some(sent) = stats.last_ping_sent {
                stats.last_rtt_ms = Some(sent.elapsed().as_secs_f32() * 1000.0);
            }
            stats.last_ping_nonce = None;
            stats.last_ping_sent = None;
        }
    }

    fn send_keepalive(&self, tx: &mpsc::UnboundedSender<WsMessage>) -> Result<(), ()> {
        let nonce = Uuid::new_v4().as_u128() as u64;
        {
            let mut stats = self.stats.lock();
            stats.last_ping_nonce = Some(nonce);
            stats.last_ping_sent = Some(Instant::now());
        }

        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&nonce.to_le_bytes());
        payload.extend_from_slice(&current_unix_millis().to_le_bytes());
        self.record_outgoing(payload.len() as u64);
        tx.send(WsMessage::Ping(payload.into())).map_err(|_| ())
    }

    fn clear_transport(&self, id: u64) {
        let mut transport = self.transport.lock();
        if transport.as_ref().is_some_and(|t| t.id == id) {
            *transport = None;
            let mut stats = self.stats.lock();
            stats.last_ping_nonce = None;
            stats.last_ping_sent = None;
        }
    }

    fn enqueue_ws(&self, message: WsMessage) -> Result<(), ()> {
        match self.transport.lock().as_ref() {
            Some(transport) => transport.tx.send(message).map_err(|_| ()),
            None => Err(()),
        }
    }

    fn mark_connected(&self, label: &str) {
        let mut stats = self.stats.lock();
        stats.connected_since = Some(Instant::now());
        stats.endpoint_label = Some(label.to_string());
    }

    fn mark_disconnected(&self) {
        let mut stats = self.stats.lock();
        stats.connected_since = None;
        stats.reconnect_attempts += 1;
        stats.last_disconnect_at = Some(Instant::now());
    }

    fn snapshot(&self) -> ChannelStatsSnapshot {
        let stats = self.stats.lock();
        ChannelStatsSnapshot {
            bytes_out: stats.bytes_out,
            bytes_in: stats.bytes_in,
            messages_out: stats.messages_out,
            messages_in: stats.messages_in,
            dropped_out: stats.dropped_out,
            last_rtt_ms: stats.last_rtt_ms,
            last_message_age: stats.last_message_at.map(|at| at.elapsed().as_secs_f32()),
            connected_duration: stats.connected_since.map(|at| at.elapsed().as_secs_f32()),
            reconnect_attempts: stats.reconnect_attempts,
            endpoint_label: stats.endpoint_label.clone(),
            last_disconnect_secs: stats
                .last_disconnect_at
                .map(|at| at.elapsed().as_secs_f32()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SyncAction;
    use tokio::net::TcpListener;

    /// Echo server that answers every text frame with the same frame
    async fn spawn_echo() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if msg.is_text() && ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn sends_while_disconnected_are_dropped() {
        let channel = SyncChannel::new();
        assert!(!channel.is_connected());
        channel.send_request(&ClientRequest::RequestSync {}).unwrap();
        let stats = channel.stats_snapshot();
        assert_eq!(stats.messages_out, 0);
        assert_eq!(stats.dropped_out, 1);
    }

    #[tokio::test]
    async fn handlers_receive_messages_across_reconnects() {
        let url = spawn_echo().await;
        let channel = SyncChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_message(move |envelope| {
            let _ = tx.send(envelope);
        });

        let message = SyncMessage {
            action: SyncAction::Seek,
            current_time: 42.0,
            timestamp: 7,
        };

        let closed = channel.connect(&url).await.unwrap();
        assert!(channel.is_connected());
        channel.send_sync("1-2", &message).unwrap();
        let echoed = rx.recv().await.unwrap();
        assert_eq!(echoed.kind, VIDEO_SYNC);
        assert_eq!(echoed.room_id.as_deref(), Some("1-2"));

        channel.disconnect();
        closed.await.unwrap();
        assert!(!channel.is_connected());
        channel.mark_disconnected();

        channel.connect(&url).await.unwrap();
        channel.send_sync("1-2", &message).unwrap();
        let echoed = rx.recv().await.unwrap();
        assert_eq!(echoed.data["current_time"], 42.0);
        assert_eq!(channel.stats_snapshot().reconnect_attempts, 1);
    }

    #[tokio::test]
    async fn connect_failure_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let channel = SyncChannel::new();
        assert!(channel.connect(&format!("ws://{addr}")).await.is_err());
        assert!(!channel.is_connected());
    }
}
