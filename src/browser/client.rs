//! CDP WebSocket client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, trace, warn};

use super::error::CdpError;
use super::page::PageSession;
use super::protocol::{BrowserVersion, CdpEvent, CdpMessage, CdpRequest};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, CdpError>>>>>;

/// Buffered events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// Shared half of the connection used by the client and its pages.
pub(crate) struct Connection {
    ws_tx: tokio::sync::Mutex<WsSink>,
    request_id: AtomicU64,
    pending: PendingMap,
    events: broadcast::Sender<CdpEvent>,
    command_timeout: Duration,
}

impl Connection {
    /// Send a CDP command and wait for its response.
    pub(crate) async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value, CdpError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);

        let request = CdpRequest {
            id,
            method: method.to_string(),
            params,
            session_id: session_id.map(str::to_string),
        };

        let json = serde_json::to_string(&request)?;
        trace!("CDP send: {}", json);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        {
            let mut ws = self.ws_tx.lock().await;
            if let Err(e) = ws.send(Message::Text(json.into())).await {
                self.pending.lock().remove(&id);
                return Err(e.into());
            }
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CdpError::SessionClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(CdpError::Timeout(format!("Request {} timed out", method)))
            }
        }
    }

    /// Subscribe to every event received from now on.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }
}

/// CDP client for browser automation.
///
/// Connects to the browser-level WebSocket and opens page sessions on it.
pub struct CdpClient {
    /// Browser WebSocket URL.
    browser_ws_url: String,
    /// Shared connection state.
    conn: Arc<Connection>,
    /// Background receive task.
    recv_task: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to the browser at the given DevTools HTTP endpoint.
    pub async fn connect(endpoint: &str, command_timeout: Duration) -> Result<Self, CdpError> {
        let http_endpoint = endpoint.trim_end_matches('/');

        let version_url = format!("{}/json/version", http_endpoint);
        debug!("Fetching browser version from {}", version_url);

        let version: BrowserVersion = reqwest::get(&version_url)
            .await
            .map_err(|e| CdpError::BrowserNotAvailable(format!("{}: {}", endpoint, e)))?
            .json()
            .await
            .map_err(|e| CdpError::BrowserNotAvailable(format!("{}: {}", endpoint, e)))?;

        debug!(
            browser = %version.browser,
            protocol = %version.protocol_version,
            "Browser discovered"
        );

        let browser_ws_url = version.web_socket_debugger_url;
        let (ws_stream, _) = tokio_tungstenite::connect_async(&browser_ws_url)
            .await
            .map_err(|e| CdpError::ConnectionFailed(format!("WebSocket: {}", e)))?;

        Ok(Self::attach(browser_ws_url, ws_stream, command_timeout))
    }

    /// Start dispatching on an already open browser WebSocket.
    fn attach(browser_ws_url: String, ws_stream: WsStream, command_timeout: Duration) -> Self {
        let (ws_sink, ws_source) = ws_stream.split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let conn = Arc::new(Connection {
            ws_tx: tokio::sync::Mutex::new(ws_sink),
            request_id: AtomicU64::new(1),
            pending: Arc::clone(&pending),
            events: events.clone(),
            command_timeout,
        });

        let recv_task = tokio::spawn(Self::receive_loop(ws_source, pending, events));

        debug!("CDP client connected to {}", browser_ws_url);

        Self {
            browser_ws_url,
            conn,
            recv_task,
        }
    }

    /// WebSocket receive loop.
    async fn receive_loop(
        mut ws_source: WsSource,
        pending: PendingMap,
        events: broadcast::Sender<CdpEvent>,
    ) {
        while let Some(msg) = ws_source.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    trace!("CDP recv: {}", text);
                    match serde_json::from_str::<CdpMessage>(&text) {
                        Ok(message) => dispatch(message, &pending, &events),
                        Err(e) => warn!("Failed to parse CDP message: {}", e),
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("WebSocket closed");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        // Wake every caller still waiting; dropping the senders yields SessionClosed.
        pending.lock().clear();
    }

    /// Send a browser-level CDP command.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CdpError> {
        self.conn.call(method, params, None).await
    }

    /// Get browser WebSocket URL.
    pub fn browser_ws_url(&self) -> &str {
        &self.browser_ws_url
    }

    /// Open a blank tab and attach a session to it.
    pub async fn new_page(&self) -> Result<PageSession, CdpError> {
        let created = self
            .call("Target.createTarget", Some(json!({"url": "about:blank"})))
            .await?;
        let target_id = created["targetId"]
            .as_str()
            .ok_or_else(|| CdpError::InvalidResponse("Missing targetId".to_string()))?
            .to_string();

        let attached = self
            .call(
                "Target.attachToTarget",
                Some(json!({
                    "targetId": target_id,
                    "flatten": true
                })),
            )
            .await?;
        let session_id = attached["sessionId"]
            .as_str()
            .ok_or_else(|| CdpError::InvalidResponse("Missing sessionId".to_string()))?
            .to_string();

        debug!(target_id = %target_id, session_id = %session_id, "Attached to new page");

        let session = PageSession::new(target_id, session_id, Arc::clone(&self.conn));
        session.enable_domains().await?;
        Ok(session)
    }

    /// Close a page/target.
    pub async fn close_page(&self, target_id: &str) -> Result<(), CdpError> {
        self.call(
            "Target.closeTarget",
            Some(json!({"targetId": target_id})),
        )
        .await?;
        Ok(())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

/// Route one incoming message to its waiting caller or to event subscribers.
fn dispatch(message: CdpMessage, pending: &PendingMap, events: &broadcast::Sender<CdpEvent>) {
    if let Some(id) = message.id {
        let waiting = pending.lock().remove(&id);
        if let Some(tx) = waiting {
            let result = match message.error {
                Some(error) => Err(CdpError::Protocol {
                    code: error.code,
                    message: error.message,
                }),
                None => Ok(message.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(result);
        }
    } else if let Some(method) = message.method {
        // No subscribers is fine; events are only watched during confirmation.
        let _ = events.send(CdpEvent {
            method,
            params: message.params.unwrap_or(Value::Null),
            session_id: message.session_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> CdpMessage {
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_routes_responses_and_events() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events, mut rx_events) = broadcast::channel(8);

        let (tx_ok, rx_ok) = oneshot::channel();
        let (tx_err, rx_err) = oneshot::channel();
        pending.lock().insert(1, tx_ok);
        pending.lock().insert(2, tx_err);

        dispatch(parse(r#"{"id":1,"result":{"ok":true}}"#), &pending, &events);
        dispatch(
            parse(r#"{"id":2,"error":{"code":-32000,"message":"No node"}}"#),
            &pending,
            &events,
        );
        dispatch(
            parse(r#"{"method":"Page.loadEventFired","params":{},"sessionId":"S"}"#),
            &pending,
            &events,
        );

        assert_eq!(rx_ok.await.unwrap().unwrap()["ok"], true);
        assert!(matches!(
            rx_err.await.unwrap(),
            Err(CdpError::Protocol { code: -32000, .. })
        ));
        let event = rx_events.recv().await.unwrap();
        assert_eq!(event.method, "Page.loadEventFired");
        assert_eq!(event.session_id.as_deref(), Some("S"));
        assert!(pending.lock().is_empty());
    }

    /// A DevTools socket that acks every command and fires the load event
    /// after `Page.reload`. Hands back the first reload request it saw.
    async fn fake_browser() -> (String, oneshot::Receiver<Value>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut seen_tx = Some(seen_tx);
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let request: Value = serde_json::from_str(&text).unwrap();
                let reply = json!({"id": request["id"], "result": {}});
                ws.send(Message::Text(reply.to_string().into())).await.unwrap();

                if request["method"] == "Page.reload" {
                    let loaded = json!({
                        "method": "Page.loadEventFired",
                        "params": {"timestamp": 1.0},
                        "sessionId": request["sessionId"],
                    });
                    ws.send(Message::Text(loaded.to_string().into())).await.unwrap();
                    if let Some(tx) = seen_tx.take() {
                        let _ = tx.send(request);
                    }
                }
            }
        });

        (url, seen_rx)
    }

    #[tokio::test]
    async fn test_reload_waits_for_load_event() {
        let (url, seen) = fake_browser().await;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let client = CdpClient::attach(url, ws_stream, Duration::from_secs(5));

        let page = PageSession::new("T".into(), "S".into(), Arc::clone(&client.conn));
        page.reload(Duration::from_secs(5)).await.unwrap();

        let request = seen.await.unwrap();
        assert_eq!(request["sessionId"], "S");
        assert_eq!(request["params"]["ignoreCache"], true);
    }
}
