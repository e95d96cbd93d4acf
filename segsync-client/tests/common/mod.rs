//! Common test utilities for segsync-client integration tests
//!
//! [`MockGameServer`] is a lightweight WebSocket server speaking the game
//! protocol closely enough to exercise the client: it records every frame
//! it receives, answers requests through a handler closure, can push frames
//! to every connected client, and can drop connections on demand.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

type Handler = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

#[derive(Clone, Debug)]
enum Control {
    Send(String),
    Drop,
}

/// Mock game server for client testing
pub struct MockGameServer {
    addr: SocketAddr,
    control: broadcast::Sender<Control>,
    received: mpsc::UnboundedReceiver<Value>,
    connections: Arc<AtomicUsize>,
    paths: Arc<Mutex<Vec<String>>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl MockGameServer {
    /// Start a server that never answers
    pub async fn silent() -> Self {
        Self::with_handler(|_| Vec::new()).await
    }

    /// Start a server answering each request with the handler's frames
    pub async fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handler: Handler = Arc::new(handler);
        let (control, _) = broadcast::channel::<Control>(64);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (received_tx, received) = mpsc::unbounded_channel::<Value>();
        let connections = Arc::new(AtomicUsize::new(0));
        let paths = Arc::new(Mutex::new(Vec::new()));

        let control_tx = control.clone();
        let connections_clone = Arc::clone(&connections);
        let paths_clone = Arc::clone(&paths);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let handler = Arc::clone(&handler);
                        let received_tx = received_tx.clone();
                        let mut control_rx = control_tx.subscribe();
                        let connections = Arc::clone(&connections_clone);
                        let paths = Arc::clone(&paths_clone);

                        tokio::spawn(async move {
                            let record_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                                paths.lock().unwrap().push(req.uri().to_string());
                                Ok(resp)
                            };
                            let Ok(ws) = accept_hdr_async(stream, record_path).await else {
                                return;
                            };
                            connections.fetch_add(1, Ordering::SeqCst);
                            let (mut write, mut read) = ws.split();

                            loop {
                                tokio::select! {
                                    incoming = read.next() => match incoming {
                                        Some(Ok(Message::Text(text))) => {
                                            let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                                                continue;
                                            };
                                            let _ = received_tx.send(frame.clone());
                                            for reply in handler(&frame) {
                                                if write.send(Message::Text(reply.to_string())).await.is_err() {
                                                    return;
                                                }
                                            }
                                        }
                                        Some(Ok(_)) => {}
                                        _ => return,
                                    },
                                    control = control_rx.recv() => match control {
                                        Ok(Control::Send(text)) => {
                                            let _ = write.send(Message::Text(text)).await;
                                        }
                                        Ok(Control::Drop) | Err(_) => return,
                                    },
                                }
                            }
                        });
                    }
                }
            }
        });

        Self {
            addr,
            control,
            received,
            connections,
            paths,
            shutdown_tx,
        }
    }

    /// Address the client connects to
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Request URIs of accepted connections, in order
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    /// Push a frame to every connected client
    pub fn push(&self, topic: &str, data: Value) {
        let frame = json!({ "type": topic, "data": data });
        let _ = self.control.send(Control::Send(frame.to_string()));
    }

    /// Drop every open connection without a close handshake
    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::Drop);
    }

    /// Next frame received from any client
    pub async fn next_frame(&mut self) -> Option<Value> {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next frame with the given `type`, skipping others
    pub async fn next_of_type(&mut self, kind: &str) -> Option<Value> {
        loop {
            let frame = self.next_frame().await?;
            if frame["type"] == kind {
                return Some(frame);
            }
        }
    }

    /// Frames received so far that have not been consumed
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.received.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Stop accepting connections
    pub async fn shutdown(self) {
        self.drop_connections();
        let _ = self.shutdown_tx.send(()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Response frame answering `request` with `data`
pub fn response_to(request: &Value, data: Value) -> Value {
    json!({
        "type": "response",
        "request_id": request["request_id"],
        "data": data,
    })
}

/// Whether a request is a session join
pub fn is_join(request: &Value) -> bool {
    request["request_id"]
        .as_str()
        .is_some_and(|id| id.starts_with("join_session_"))
}

/// Poll `check` until it holds or five seconds pass
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
