//! WebSocket transport
//!
//! Outbound OCPP-J WebSocket client. Offers the `ocpp1.6, ocpp1.5`
//! subprotocols, injects HTTP Basic auth when configured, and reconnects
//! with exponential backoff after any non-manual close. `disconnect()`
//! cancels the connection task, which doubles as the manual-disconnect
//! flag: a cancelled task never schedules another attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, Uri};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Transport, TransportError, TransportEvent};
use crate::config::BasicAuth;

/// Subprotocols offered during the upgrade, in preference order.
const SUBPROTOCOL_OFFER: &str = "ocpp1.6, ocpp1.5";

/// Close code reported for abnormal terminations without a close frame.
const ABNORMAL_CLOSE: u16 = 1006;

const EVENT_CAPACITY: usize = 256;

/// Connection settings for [`WsTransport`].
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Base URL; the charge point id is appended verbatim.
    pub ws_url: String,
    pub charge_point_id: String,
    pub basic_auth: Option<BasicAuth>,
    /// First reconnect delay. Doubles per attempt.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Stop reconnecting after this many consecutive failures.
    pub max_attempts: Option<u32>,
}

impl WsTransportConfig {
    pub fn new(ws_url: impl Into<String>, charge_point_id: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            charge_point_id: charge_point_id.into(),
            basic_auth: None,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }

    pub fn with_basic_auth(mut self, auth: BasicAuth) -> Self {
        self.basic_auth = Some(auth);
        self
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.ws_url, self.charge_point_id)
    }
}

struct Shared {
    config: WsTransportConfig,
    events: broadcast::Sender<TransportEvent>,
    open: AtomicBool,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

struct RunHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

/// WebSocket client transport.
pub struct WsTransport {
    shared: Arc<Shared>,
    run: Mutex<Option<RunHandle>>,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                events,
                open: AtomicBool::new(false),
                outgoing: Mutex::new(None),
            }),
            run: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut run = self.run.lock().unwrap();
            if run.is_some() {
                warn!("connect() on an already-connected transport; ignoring");
                return Ok(());
            }
            // Validate the endpoint up front so a bad URL fails loudly
            // instead of spinning in the reconnect loop.
            let endpoint = self.shared.config.endpoint();
            endpoint
                .parse::<Uri>()
                .map_err(|e| TransportError::InvalidUrl(format!("{endpoint}: {e}")))?;

            let cancel = CancellationToken::new();
            let task = tokio::spawn(run_loop(self.shared.clone(), cancel.clone()));
            *run = Some(RunHandle { task, cancel });
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let handle = self.run.lock().unwrap().take();
        match handle {
            Some(RunHandle { task, cancel }) => {
                cancel.cancel();
                let _ = task.await;
            }
            None => debug!("disconnect() with no active connection"),
        }
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn send(&self, text: String) {
        if !self.is_open() {
            warn!("send while socket is not open; frame dropped");
            return;
        }
        if let Some(tx) = self.shared.outgoing.lock().unwrap().as_ref() {
            let _ = tx.send(text);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

/// Reconnect delay for the n-th consecutive failed attempt (1-based):
/// `min(max, base * 2^(attempt-1))`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(max)
}

async fn run_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match connect_once(&shared.config).await {
            Ok(ws) => {
                attempts = 0;
                shared.open.store(true, Ordering::SeqCst);
                let (tx, rx) = mpsc::unbounded_channel();
                *shared.outgoing.lock().unwrap() = Some(tx);
                let _ = shared.events.send(TransportEvent::Opened);

                let code = pump(ws, rx, &shared, &cancel).await;

                shared.open.store(false, Ordering::SeqCst);
                *shared.outgoing.lock().unwrap() = None;
                let manual = cancel.is_cancelled();
                let _ = shared.events.send(TransportEvent::Closed { code, manual });
                if manual {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "connect attempt failed");
            }
        }

        attempts += 1;
        if let Some(cap) = shared.config.max_attempts {
            if attempts > cap {
                error!(attempts, "reconnect attempt cap reached; giving up");
                break;
            }
        }

        let delay = backoff_delay(shared.config.base_delay, shared.config.max_delay, attempts);
        info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
    }
}

async fn connect_once(
    config: &WsTransportConfig,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, TransportError> {
    let endpoint = config.endpoint();
    let uri: Uri = endpoint
        .parse()
        .map_err(|e| TransportError::InvalidUrl(format!("{endpoint}: {e}")))?;

    let mut builder = Request::builder()
        .uri(&endpoint)
        .header(header::SEC_WEBSOCKET_PROTOCOL, SUBPROTOCOL_OFFER)
        .header(header::HOST, uri.host().unwrap_or("localhost"));

    if let Some(auth) = &config.basic_auth {
        let token = BASE64.encode(format!("{}:{}", auth.username, auth.password));
        builder = builder.header(header::AUTHORIZATION, format!("Basic {token}"));
    }

    let request = builder
        .body(())
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

    let (ws, response) = connect_async(request)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    let negotiated = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    info!(url = %endpoint, subprotocol = ?negotiated, "websocket connected");

    Ok(ws)
}

/// Shuffle frames in both directions until the socket closes. Returns
/// the close code, if any arrived.
async fn pump(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    shared: &Arc<Shared>,
    cancel: &CancellationToken,
) -> Option<u16> {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return None;
            }
            out = outgoing.recv() => match out {
                Some(text) => {
                    debug!(frame = %text, "->");
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        error!(error = %e, "send failed");
                        return Some(ABNORMAL_CLOSE);
                    }
                }
                None => return None,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    debug!(frame = %text, "<-");
                    let _ = shared.events.send(TransportEvent::Frame(text));
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    info!(?code, "close frame received");
                    return code;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // pong handled by tungstenite
                }
                Some(Ok(Message::Binary(data))) => {
                    warn!(bytes = data.len(), "binary frame ignored");
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    error!(error = %e, "websocket error");
                    return Some(ABNORMAL_CLOSE);
                }
                None => {
                    info!("websocket stream ended");
                    return Some(ABNORMAL_CLOSE);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_clamps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let expected = [1u64, 2, 4, 8, 16, 30, 30, 30];
        for (i, want) in expected.iter().enumerate() {
            let got = backoff_delay(base, max, i as u32 + 1);
            assert_eq!(got, Duration::from_secs(*want), "attempt {}", i + 1);
        }
    }

    #[test]
    fn backoff_survives_large_attempt_counts() {
        let d = backoff_delay(Duration::from_secs(1), Duration::from_secs(30), 1000);
        assert_eq!(d, Duration::from_secs(30));
    }

    #[test]
    fn endpoint_is_url_plus_id() {
        let config = WsTransportConfig::new("ws://csms.example/ocpp/", "CP-42");
        assert_eq!(config.endpoint(), "ws://csms.example/ocpp/CP-42");
    }
}
