//! Console capture: a bounded per-page buffer and an optional WebSocket feed.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::browser::ConsoleEntry;
use crate::error::{PagewrightError, Result};

pub const DEFAULT_CONSOLE_LIMIT: usize = 200;

/// Ring buffer of console entries; the oldest entry is evicted when full.
#[derive(Debug)]
pub struct ConsoleBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<ConsoleEntry>>,
    live: broadcast::Sender<ConsoleEntry>,
}

impl ConsoleBuffer {
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            live,
        }
    }

    pub fn push(&self, entry: ConsoleEntry) {
        {
            let mut entries = self.entries.lock();
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        // No subscribers is the common case.
        let _ = self.live.send(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The newest `limit` entries, optionally only those at or after `since` (ms).
    pub fn get(&self, since: Option<f64>, limit: usize) -> Vec<ConsoleEntry> {
        let entries = self.entries.lock();
        let matching: Vec<&ConsoleEntry> = entries
            .iter()
            .filter(|e| since.map_or(true, |since| e.timestamp >= since))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleEntry> {
        self.live.subscribe()
    }
}

fn console_message(entry: &ConsoleEntry) -> String {
    serde_json::json!({ "type": "console", "data": entry }).to_string()
}

/// WebSocket server broadcasting one page's console entries to every client.
pub struct ConsoleServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    accept: JoinHandle<()>,
}

impl ConsoleServer {
    /// Bind `host:port` (port 0 picks a free one) and start accepting clients.
    pub async fn start(buffer: Arc<ConsoleBuffer>, host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            PagewrightError::Other(format!("Failed to bind console stream to {}:{}: {}", host, port, e))
        })?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let accept = tokio::spawn(accept_loop(listener, buffer, cancel.clone()));
        debug!("console stream listening on ws://{}", addr);

        Ok(Self {
            addr,
            cancel,
            accept,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Close every client connection and stop listening.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.accept.await {
            warn!("console stream accept loop ended abnormally: {}", e);
        }
    }
}

async fn accept_loop(listener: TcpListener, buffer: Arc<ConsoleBuffer>, cancel: CancellationToken) {
    let mut clients = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("console stream client {}", peer);
                    clients.push(tokio::spawn(serve_client(
                        stream,
                        buffer.subscribe(),
                        cancel.clone(),
                    )));
                }
                Err(e) => warn!("console stream accept failed: {}", e),
            },
        }
    }
    for client in clients {
        let _ = client.await;
    }
}

async fn serve_client(
    stream: TcpStream,
    mut entries: broadcast::Receiver<ConsoleEntry>,
    cancel: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("console stream handshake failed: {}", e);
            return;
        }
    };
    let (mut write, mut read) = ws.split();

    let hello = serde_json::json!({ "type": "status", "connected": true });
    if write.send(Message::Text(hello.to_string().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            entry = entries.recv() => match entry {
                Ok(entry) => {
                    if write.send(Message::Text(console_message(&entry).into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("console stream client lagged, {} entries skipped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(timestamp: f64, text: &str) -> ConsoleEntry {
        ConsoleEntry {
            timestamp,
            kind: "log".to_string(),
            text: text.to_string(),
            location: None,
            args: vec![serde_json::json!(text)],
        }
    }

    #[test]
    fn buffer_evicts_oldest() {
        let buffer = ConsoleBuffer::new(2);
        buffer.push(entry(1.0, "a"));
        buffer.push(entry(2.0, "b"));
        buffer.push(entry(3.0, "c"));

        let texts: Vec<String> = buffer.get(None, 10).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn get_filters_by_since_and_keeps_newest() {
        let buffer = ConsoleBuffer::new(10);
        for i in 1..=5 {
            buffer.push(entry(i as f64, &i.to_string()));
        }

        let texts: Vec<String> = buffer
            .get(Some(2.0), 2)
            .into_iter()
            .map(|e| e.text)
            .collect();
        assert_eq!(texts, vec!["4", "5"]);
        assert_eq!(buffer.get(Some(10.0), 5).len(), 0);
    }

    #[test]
    fn console_message_uses_wire_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&console_message(&entry(5.0, "hi"))).unwrap();
        assert_eq!(json["type"], "console");
        assert_eq!(json["data"]["type"], "log");
        assert_eq!(json["data"]["text"], "hi");
    }

    #[tokio::test]
    async fn server_greets_and_broadcasts() {
        let buffer = Arc::new(ConsoleBuffer::new(10));
        let server = ConsoleServer::start(buffer.clone(), "127.0.0.1", 0)
            .await
            .unwrap();
        let url = format!("ws://{}", server.local_addr());

        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let hello = ws.next().await.unwrap().unwrap();
        assert!(hello.to_text().unwrap().contains("\"connected\":true"));

        buffer.push(entry(1.0, "from page"));
        let msg = ws.next().await.unwrap().unwrap();
        assert!(msg.to_text().unwrap().contains("from page"));

        server.stop().await;
    }
}
