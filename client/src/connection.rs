use std::fmt;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use url::Url;

use crate::channel::SyncChannel;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting {
        label: String,
        attempt: u32,
    },
    Connected {
        label: String,
    },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting { label, attempt } => {
                write!(f, "connecting to {label} (attempt {attempt})")
            }
            Self::Connected { label } => write!(f, "connected to {label}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub label: String,
    pub url: String,
}

impl Endpoint {
    /// Label an endpoint by its host so status lines stay short
    pub fn from_url(url: &str) -> Self {
        let label = Url::parse(url)
            .ok()
            .and_then(|u| {
                u.host_str()
                    .map(|host| match u.port() {
                        Some(port) => format!("{host}:{port}"),
                        None => host.to_string(),
                    })
            })
            .unwrap_or_else(|| url.to_string());
        Self {
            label,
            url: url.to_string(),
        }
    }

    fn is_local(&self) -> bool {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| {
                u.host_str()
                    .map(|h| h == "localhost" || h == "127.0.0.1" || h == "[::1]")
            })
            .unwrap_or(false)
    }
}

/// Linear backoff capped at `max_factor` steps
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max_factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max_factor: 6,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base * attempt.clamp(1, self.max_factor)
    }
}

/// Keep `channel` connected until `reconnect_rx` closes.
///
/// Endpoints are tried in order. A manual reconnect request (a `()` on
/// `reconnect_rx`) drops the current socket and restarts from the first
/// endpoint with a fresh attempt counter.
pub async fn run_connection_loop(
    channel: SyncChannel,
    endpoints: Vec<Endpoint>,
    backoff: Backoff,
    status_tx: watch::Sender<ConnectionStatus>,
    mut reconnect_rx: mpsc::UnboundedReceiver<()>,
) {
    if endpoints.is_empty() {
        tracing::error!("No sync server endpoints configured");
        return;
    }
    let mut attempt: u32 = 0;

    'outer: loop {
        for endpoint in &endpoints {
            attempt += 1;
            let label = endpoint.label.as_str();
            let url = endpoint.url.as_str();
            let _ = status_tx.send(ConnectionStatus::Connecting {
                label: label.to_string(),
                attempt,
            });

            if !endpoint.is_local() {
                warm_up_backend(label, url).await;
            }

            match channel.connect(url).await {
                Ok(closed) => {
                    tracing::info!("Connected to {label} sync server at {url}");
                    channel.mark_connected(label);
                    let _ = status_tx.send(ConnectionStatus::Connected {
                        label: label.to_string(),
                    });
                    attempt = 0;

                    tokio::select! {
                        _ = closed => {
                            tracing::warn!("Lost connection to {label} sync server");
                        }
                        recv = reconnect_rx.recv() => {
                            channel.disconnect();
                            channel.mark_disconnected();
                            let _ = status_tx.send(ConnectionStatus::Disconnected);
                            if recv.is_none() {
                                tracing::info!("Reconnect channel closed; stopping connection loop");
                                return;
                            }
                            tracing::info!("Manual reconnect requested; restarting connection attempts");
                            continue 'outer;
                        }
                    }
                    channel.mark_disconnected();
                    let _ = status_tx.send(ConnectionStatus::Disconnected);
                }
                Err(e) => {
                    tracing::warn!("Failed to connect to {label} sync server at {url}: {:#}", e);
                }
            }

            let delay = backoff.delay(attempt);
            tracing::debug!("Next connection attempt in {:?}", delay);
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            tokio::select! {
                _ = sleep.as_mut() => {},
                recv = reconnect_rx.recv() => {
                    if recv.is_none() {
                        tracing::info!("Reconnect channel closed; stopping connection loop");
                        return;
                    }
                    tracing::info!("Manual reconnect requested; restarting connection attempts");
                    attempt = 0;
                    continue 'outer;
                }
            }
        }
    }
}

/// Hosted relays may be asleep; poke their health check before the upgrade
async fn warm_up_backend(label: &str, ws_url: &str) {
    let Some(health_url) = health_url_from_ws(ws_url) else {
        return;
    };

    let client = reqwest::Client::new();
    match client
        .get(&health_url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(response) => {
            tracing::info!(
                "Warmup request to {label} backend at {} returned {}",
                health_url,
                response.status()
            );
        }
        Err(e) => {
            tracing::warn!(
                "Warmup request to {label} backend at {} failed: {}",
                health_url,
                e
            );
        }
    }
}

pub fn health_url_from_ws(ws_url: &str) -> Option<String> {
    let parsed = Url::parse(ws_url).ok()?;
    let scheme = match parsed.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return None,
    };

    let mut http = parsed;
    http.set_scheme(scheme).ok()?;
    http.set_path("/healthz");
    http.set_query(None);
    http.set_fragment(None);
    Some(http.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;

    #[test]
    fn backoff_is_linear_and_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(5));
        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(3), Duration::from_secs(15));
        assert_eq!(backoff.delay(6), Duration::from_secs(30));
        assert_eq!(backoff.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn health_url_mirrors_websocket_origin() {
        assert_eq!(
            health_url_from_ws("wss://relay.example.com/ws?token=abc").as_deref(),
            Some("https://relay.example.com/healthz")
        );
        assert_eq!(
            health_url_from_ws("ws://localhost:3005/ws").as_deref(),
            Some("http://localhost:3005/healthz")
        );
        assert_eq!(health_url_from_ws("http://localhost:3005"), None);
    }

    #[test]
    fn endpoints_are_labelled_by_host() {
        let endpoint = Endpoint::from_url("ws://localhost:3005/ws");
        assert_eq!(endpoint.label, "localhost:3005");
        assert!(endpoint.is_local());
        assert!(!Endpoint::from_url("wss://relay.example.com/ws").is_local());
    }

    /// Accepts sockets and closes each one as soon as `close_rx` fires
    async fn spawn_closable_server() -> (String, mpsc::UnboundedSender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (close_tx, mut close_rx) = mpsc::unbounded_channel::<()>();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                tokio::select! {
                    _ = close_rx.recv() => {
                        let _ = ws.close(None).await;
                    }
                    _ = async { while let Some(Ok(_)) = ws.next().await {} } => {}
                }
                let _ = ws.flush().await;
            }
        });
        (format!("ws://{addr}/ws"), close_tx)
    }

    async fn wait_for(
        status_rx: &mut watch::Receiver<ConnectionStatus>,
        pred: impl Fn(&ConnectionStatus) -> bool,
    ) -> ConnectionStatus {
        loop {
            let current = status_rx.borrow_and_update().clone();
            if pred(&current) {
                return current;
            }
            status_rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn reconnects_after_server_drop() {
        let (url, close_tx) = spawn_closable_server().await;
        let channel = SyncChannel::new();
        let (status_tx, mut status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let backoff = Backoff {
            base: Duration::from_millis(20),
            max_factor: 6,
        };
        tokio::spawn(run_connection_loop(
            channel.clone(),
            vec![Endpoint::from_url(&url)],
            backoff,
            status_tx,
            reconnect_rx,
        ));

        let connected_after = |reconnects: u32| {
            let channel = channel.clone();
            move |status: &ConnectionStatus| {
                status.is_connected()
                    && channel.is_connected()
                    && channel.stats_snapshot().reconnect_attempts == reconnects
            }
        };

        wait_for(&mut status_rx, connected_after(0)).await;
        close_tx.send(()).unwrap();
        wait_for(&mut status_rx, connected_after(1)).await;

        reconnect_tx.send(()).unwrap();
        wait_for(&mut status_rx, connected_after(2)).await;
    }
}
