//! A CDP session attached to a single page.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::client::Connection;
use super::error::CdpError;
use super::protocol::{CdpEvent, MouseButton, MouseEventType};

/// A session attached to a single page/target.
pub struct PageSession {
    target_id: String,
    session_id: String,
    conn: Arc<Connection>,
}

impl PageSession {
    pub(crate) fn new(target_id: String, session_id: String, conn: Arc<Connection>) -> Self {
        Self {
            target_id,
            session_id,
            conn,
        }
    }

    /// Get target ID.
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Get session ID.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send a CDP command to this page session.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CdpError> {
        self.conn.call(method, params, Some(&self.session_id)).await
    }

    /// Subscribe to events; the receiver sees only events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.conn.subscribe()
    }

    /// Whether an event belongs to this page.
    pub fn owns(&self, event: &CdpEvent) -> bool {
        event.session_id.as_deref() == Some(self.session_id.as_str())
    }

    /// Enable required CDP domains.
    pub(crate) async fn enable_domains(&self) -> Result<(), CdpError> {
        self.call("Page.enable", None).await?;
        self.call("Runtime.enable", None).await?;
        self.call("Network.enable", None).await?;

        debug!("Enabled CDP domains for session {}", self.session_id);
        Ok(())
    }

    /// Navigate to URL and wait for the load event.
    pub async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), CdpError> {
        let mut events = self.subscribe();
        let result = self
            .call("Page.navigate", Some(json!({"url": url})))
            .await?;

        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            return Err(CdpError::NavigationFailed(format!("{url}: {error}")));
        }

        self.wait_for_event(&mut events, "Page.loadEventFired", timeout)
            .await?;
        debug!("Navigated to {}", url);
        Ok(())
    }

    /// Reload page and wait for the load event.
    pub async fn reload(&self, timeout: Duration) -> Result<(), CdpError> {
        let mut events = self.subscribe();
        self.call("Page.reload", Some(json!({"ignoreCache": true})))
            .await?;
        self.wait_for_event(&mut events, "Page.loadEventFired", timeout)
            .await?;
        debug!("Reloaded page");
        Ok(())
    }

    /// Wait until this page emits `method`.
    async fn wait_for_event(
        &self,
        events: &mut broadcast::Receiver<CdpEvent>,
        method: &str,
        timeout: Duration,
    ) -> Result<CdpEvent, CdpError> {
        let deadline = Instant::now() + timeout;
        loop {
            let received = tokio::time::timeout_at(deadline, events.recv())
                .await
                .map_err(|_| CdpError::Timeout(format!("Waiting for {method}")))?;
            match received {
                Ok(event) if event.method == method && self.owns(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(CdpError::SessionClosed),
            }
        }
    }

    /// Evaluate JavaScript expression and return its value.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, CdpError> {
        let result = self
            .call(
                "Runtime.evaluate",
                Some(json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                })),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception["exception"]["description"]
                .as_str()
                .or_else(|| exception["text"].as_str())
                .unwrap_or("Unknown error");
            return Err(CdpError::JavaScript(text.to_string()));
        }

        Ok(result["result"]["value"].clone())
    }

    /// URLs of every frame in the page, main frame first.
    pub async fn frame_urls(&self) -> Result<Vec<String>, CdpError> {
        let tree = self.call("Page.getFrameTree", None).await?;
        let mut urls = Vec::new();
        collect_frame_urls(&tree["frameTree"], &mut urls);
        Ok(urls)
    }

    /// Click at coordinates.
    pub async fn click(&self, x: f64, y: f64) -> Result<(), CdpError> {
        for event_type in [
            MouseEventType::MouseMoved,
            MouseEventType::MousePressed,
            MouseEventType::MouseReleased,
        ] {
            self.call(
                "Input.dispatchMouseEvent",
                Some(json!({
                    "type": event_type,
                    "x": x,
                    "y": y,
                    "button": MouseButton::Left,
                    "clickCount": 1,
                })),
            )
            .await?;
        }

        debug!("Clicked at ({}, {})", x, y);
        Ok(())
    }

    /// Body of a finished network response.
    pub async fn response_body(&self, request_id: &str) -> Result<String, CdpError> {
        let result = self
            .call(
                "Network.getResponseBody",
                Some(json!({"requestId": request_id})),
            )
            .await?;

        let body = result["body"].as_str().unwrap_or_default();
        if result["base64Encoded"].as_bool().unwrap_or(false) {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(body)
                .map_err(|e| CdpError::InvalidResponse(format!("Response body: {e}")))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            Ok(body.to_string())
        }
    }

    /// Get page HTML content.
    pub async fn content(&self) -> Result<String, CdpError> {
        let result = self.evaluate("document.documentElement.outerHTML").await?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }

    /// Capture the viewport as JPEG bytes.
    pub async fn screenshot_jpeg(&self, quality: u8) -> Result<Vec<u8>, CdpError> {
        let result = self
            .call(
                "Page.captureScreenshot",
                Some(json!({"format": "jpeg", "quality": quality})),
            )
            .await?;

        let data = result["data"]
            .as_str()
            .ok_or_else(|| CdpError::InvalidResponse("Missing screenshot data".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| CdpError::InvalidResponse(format!("Screenshot data: {e}")))
    }
}

fn collect_frame_urls(node: &Value, urls: &mut Vec<String>) {
    if let Some(url) = node["frame"]["url"].as_str() {
        urls.push(url.to_string());
    }
    if let Some(children) = node["childFrames"].as_array() {
        for child in children {
            collect_frame_urls(child, urls);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_frame_urls() {
        let tree = json!({
            "frame": {"id": "main", "url": "https://example.com/form"},
            "childFrames": [
                {"frame": {"id": "a", "url": "https://www.google.com/recaptcha/api2/anchor"}},
                {
                    "frame": {"id": "b", "url": "about:blank"},
                    "childFrames": [{"frame": {"id": "c", "url": "https://ads.example"}}]
                }
            ]
        });

        let mut urls = Vec::new();
        collect_frame_urls(&tree, &mut urls);
        assert_eq!(
            urls,
            vec![
                "https://example.com/form",
                "https://www.google.com/recaptcha/api2/anchor",
                "about:blank",
                "https://ads.example",
            ]
        );
    }
}
