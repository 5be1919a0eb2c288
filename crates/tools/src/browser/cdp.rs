//! Chrome DevTools Protocol client over WebSocket.
//!
//! One connection per page target. Commands are matched to responses by id;
//! events fan out to subscribers by method name.

use serde_json::{json, Value};
use sisypho_core::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type ListenerMap = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>;

pub struct CdpClient {
    ws_tx: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    event_listeners: ListenerMap,
    /// Set once the socket is gone; the page is no longer usable.
    closed: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url).await.map_err(|e| {
            Error::Browser(format!("Failed to connect to CDP endpoint {}: {}", ws_url, e))
        })?;

        let (mut ws_sink, mut ws_stream_read) = ws_stream.split();
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let event_listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer_closed = closed.clone();
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
        });

        let pending_clone = pending.clone();
        let events_clone = event_listeners.clone();
        let reader_closed = closed.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_stream_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(Value::as_u64) {
                            if let Some(tx) = pending_clone.lock().await.remove(&id) {
                                let _ = tx.send(val);
                            }
                        } else if let Some(method) = val.get("method").and_then(Value::as_str) {
                            let params = val.get("params").cloned().unwrap_or(Value::Null);
                            dispatch_event(&mut *events_clone.lock().await, method, &params);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by browser");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Wake every waiter; their senders drop here.
            pending_clone.lock().await.clear();
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            event_listeners,
            closed,
            reader_handle,
            writer_handle,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a command and wait for its response.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::Browser(format!("CDP connection closed ({})", method)));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        self.ws_tx
            .send(msg.to_string())
            .await
            .map_err(|e| Error::Browser(format!("Failed to send CDP command: {}", e)))?;

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    Err(Error::Browser(format!("CDP error in {}: {}", method, error)))
                } else {
                    Ok(response.get("result").cloned().unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err(Error::Browser(format!(
                "CDP connection closed while waiting for {}",
                method
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Timeout(format!(
                    "CDP command '{}' timed out after {}s",
                    method,
                    COMMAND_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// Subscribe to an event; the receiver gets each event's params.
    pub async fn subscribe_event(&self, method: &str) -> mpsc::Receiver<Value> {
        add_listener(&mut *self.event_listeners.lock().await, method)
    }

    pub async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.send_command(&format!("{}.enable", domain), json!({}))
            .await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<Value> {
        self.send_command("Page.navigate", json!({"url": url})).await
    }

    /// Evaluate an expression and return its value. Page-side exceptions are errors.
    pub async fn evaluate_js(&self, expression: &str) -> Result<Value> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .pointer("/exception/description")
                .and_then(Value::as_str)
                .or_else(|| details.get("text").and_then(Value::as_str))
                .unwrap_or("script exception");
            return Err(Error::Browser(format!("JavaScript error: {}", text)));
        }
        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn dispatch_key_event(
        &self,
        event_type: &str,
        key: &str,
        code: &str,
        key_code: i32,
    ) -> Result<()> {
        let mut params = json!({
            "type": event_type,
            "key": key,
            "code": code,
            "windowsVirtualKeyCode": key_code,
        });
        if event_type == "keyDown" && key == "Enter" {
            params["text"] = json!("\r");
        }
        self.send_command("Input.dispatchKeyEvent", params).await?;
        Ok(())
    }

    /// Insert text at the focused element without synthesizing key events.
    pub async fn insert_text(&self, text: &str) -> Result<()> {
        self.send_command("Input.insertText", json!({"text": text}))
            .await?;
        Ok(())
    }

    pub async fn clear_browser_cache(&self) -> Result<()> {
        self.send_command("Network.clearBrowserCache", json!({}))
            .await?;
        Ok(())
    }
}

/// Register a subscriber after dropping every subscriber whose receiver is gone.
fn add_listener(listeners: &mut HashMap<String, Vec<mpsc::Sender<Value>>>, method: &str) -> mpsc::Receiver<Value> {
    listeners.retain(|_, senders| {
        senders.retain(|tx| !tx.is_closed());
        !senders.is_empty()
    });
    let (tx, rx) = mpsc::channel(64);
    listeners.entry(method.to_string()).or_default().push(tx);
    rx
}

fn dispatch_event(listeners: &mut HashMap<String, Vec<mpsc::Sender<Value>>>, method: &str, params: &Value) {
    let Some(senders) = listeners.get_mut(method) else {
        return;
    };
    senders.retain(|tx| !tx.is_closed());
    for tx in senders.iter() {
        let _ = tx.try_send(params.clone());
    }
    if senders.is_empty() {
        listeners.remove(method);
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let mut listeners = HashMap::new();
        for _ in 0..5 {
            drop(add_listener(&mut listeners, "Page.loadEventFired"));
        }
        let mut live = add_listener(&mut listeners, "Page.loadEventFired");
        assert_eq!(listeners["Page.loadEventFired"].len(), 1);

        dispatch_event(&mut listeners, "Page.loadEventFired", &json!({"timestamp": 1}));
        assert_eq!(live.recv().await, Some(json!({"timestamp": 1})));

        drop(live);
        dispatch_event(&mut listeners, "Page.loadEventFired", &json!({}));
        assert!(listeners.is_empty());
    }

    #[tokio::test]
    async fn test_other_methods_are_pruned_on_subscribe() {
        let mut listeners = HashMap::new();
        drop(add_listener(&mut listeners, "Network.requestWillBeSent"));
        let _rx = add_listener(&mut listeners, "Page.loadEventFired");
        assert_eq!(listeners.len(), 1);
        assert!(listeners.contains_key("Page.loadEventFired"));
    }
}
