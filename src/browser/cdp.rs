//! Chrome DevTools Protocol client over one persistent WebSocket.
//!
//! The client is attached to the browser endpoint; pages are driven through
//! flattened target sessions, so every command and event carries an optional
//! `sessionId`. Responses are correlated by id, events fan out to listeners
//! registered for `(session, method)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::error::{PagewrightError, Result};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

struct Listener {
    session: Option<String>,
    method: String,
    tx: mpsc::UnboundedSender<Value>,
}

type Listeners = Arc<Mutex<Vec<Listener>>>;

pub struct CdpClient {
    outgoing: mpsc::UnboundedSender<String>,
    pending: Pending,
    listeners: Listeners,
    next_id: AtomicU64,
    timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a browser (or page) WebSocket debugger URL.
    pub async fn connect(ws_url: &str, timeout: Duration) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(ws_url).await.map_err(|e| {
            PagewrightError::CdpConnectionFailed(format!("Failed to connect to {}: {}", ws_url, e))
        })?;
        let (mut sink, mut stream) = ws.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));

        let writer = tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!("CDP WebSocket write error: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = {
            let pending = pending.clone();
            let listeners = listeners.clone();
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    match message {
                        Ok(Message::Text(text)) => match serde_json::from_str::<Value>(text.as_str()) {
                            Ok(value) => dispatch(value, &pending, &listeners),
                            Err(e) => debug!("Ignoring malformed CDP message: {}", e),
                        },
                        Ok(Message::Close(_)) => {
                            debug!("CDP WebSocket closed by browser");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("CDP WebSocket read error: {}", e);
                            break;
                        }
                    }
                }
                // Wake every waiter; their oneshot senders are dropped here.
                pending.lock().clear();
                listeners.lock().clear();
            })
        };

        Ok(Self {
            outgoing,
            pending,
            listeners,
            next_id: AtomicU64::new(1),
            timeout,
            reader,
            writer,
        })
    }

    /// Browser-level command.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.call_session(None, method, params).await
    }

    /// Command addressed to a flattened target session (`None` = browser).
    pub async fn call_session(
        &self,
        session: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut message = json!({ "id": id, "method": method, "params": params });
        if let Some(session) = session {
            message["sessionId"] = json!(session);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        trace!(id, method, "CDP ->");

        if self.outgoing.send(message.to_string()).is_err() {
            self.pending.lock().remove(&id);
            return Err(closed());
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(closed()),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(PagewrightError::Timeout(format!(
                    "CDP command '{}' got no answer within {:?}",
                    method, self.timeout
                )));
            }
        };

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(PagewrightError::Protocol(match error.get("data").and_then(Value::as_str) {
                Some(data) => format!("{} ({}): {}", message, method, data),
                None => format!("{} ({})", message, method),
            }));
        }

        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Event params for `method` on `session` (`None` = browser-level events).
    pub fn subscribe(&self, session: Option<&str>, method: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(Listener {
            session: session.map(str::to_string),
            method: method.to_string(),
            tx,
        });
        rx
    }

    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished()
    }

    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
        self.pending.lock().clear();
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed() -> PagewrightError {
    PagewrightError::SessionClosed("browser connection closed".to_string())
}

fn dispatch(value: Value, pending: &Pending, listeners: &Listeners) {
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        if let Some(tx) = pending.lock().remove(&id) {
            let _ = tx.send(value);
        }
        return;
    }

    let Some(method) = value.get("method").and_then(Value::as_str) else {
        return;
    };
    let session = value.get("sessionId").and_then(Value::as_str);
    let params = value.get("params").cloned().unwrap_or(Value::Null);

    // Drop listeners whose receiver is gone.
    listeners.lock().retain(|l| {
        if l.method != method || l.session.as_deref() != session {
            return !l.tx.is_closed();
        }
        l.tx.send(params.clone()).is_ok()
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (Pending, Listeners) {
        (
            Arc::new(Mutex::new(HashMap::new())),
            Arc::new(Mutex::new(Vec::new())),
        )
    }

    #[test]
    fn responses_are_routed_by_id() {
        let (pending, listeners) = registry();
        let (tx, mut rx) = oneshot::channel();
        pending.lock().insert(7, tx);

        dispatch(json!({"id": 7, "result": {"ok": true}}), &pending, &listeners);

        assert_eq!(rx.try_recv().unwrap()["result"]["ok"], true);
        assert!(pending.lock().is_empty());
    }

    #[test]
    fn events_are_routed_by_session_and_method() {
        let (pending, listeners) = registry();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        listeners.lock().push(Listener {
            session: Some("S1".into()),
            method: "Page.loadEventFired".into(),
            tx: tx_a,
        });
        listeners.lock().push(Listener {
            session: Some("S2".into()),
            method: "Page.loadEventFired".into(),
            tx: tx_b,
        });

        dispatch(
            json!({"method": "Page.loadEventFired", "sessionId": "S1", "params": {"timestamp": 1.0}}),
            &pending,
            &listeners,
        );

        assert_eq!(rx_a.try_recv().unwrap()["timestamp"], 1.0);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn closed_listeners_are_pruned() {
        let (pending, listeners) = registry();
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.lock().push(Listener {
            session: None,
            method: "Target.targetCreated".into(),
            tx,
        });
        drop(rx);

        dispatch(
            json!({"method": "Target.targetCreated", "params": {}}),
            &pending,
            &listeners,
        );
        assert!(listeners.lock().is_empty());
    }
}
