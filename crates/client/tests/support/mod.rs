//! Loopback WebSocket server used by the integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

enum ServerCmd {
    Send(String),
    Close,
}

/// Accepts any number of clients on a random local port, records every text
/// frame they send, and lets the test push frames or drop clients.
pub struct WsServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
    clients: Arc<Mutex<Vec<UnboundedSender<ServerCmd>>>>,
}

impl WsServer {
    pub async fn start() -> Self {
        Self::start_with_capacity(usize::MAX).await
    }

    /// Like [`WsServer::start`], but stop listening after `max` accepted
    /// connections. Later connection attempts are refused, which lets tests
    /// exercise reconnect failure paths.
    pub async fn start_with_capacity(max: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let clients: Arc<Mutex<Vec<UnboundedSender<ServerCmd>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let accept_counter = accepted.clone();
        let frame_log = received.clone();
        let client_registry = clients.clone();
        tokio::spawn(async move {
            let mut remaining = max;
            while remaining > 0 {
                remaining -= 1;
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                accept_counter.fetch_add(1, Ordering::SeqCst);
                let (cmd_tx, mut cmd_rx) = unbounded_channel();
                client_registry.lock().unwrap().push(cmd_tx);
                let frame_log = frame_log.clone();
                tokio::spawn(async move {
                    let (mut sink, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            cmd = cmd_rx.recv() => match cmd {
                                Some(ServerCmd::Send(text)) => {
                                    if sink.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Some(ServerCmd::Close) | None => {
                                    let _ = sink.close().await;
                                    break;
                                }
                            },
                            frame = read.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    frame_log.lock().unwrap().push(text.as_str().to_string());
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(_)) => break,
                            },
                        }
                    }
                });
            }
        });

        Self {
            addr,
            accepted,
            received,
            clients,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Total connections accepted since startup, including re-connects.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Every text frame received from any client, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Push a text frame to every connected client.
    pub fn send_to_all(&self, text: &str) {
        for client in self.clients.lock().unwrap().iter() {
            let _ = client.send(ServerCmd::Send(text.to_string()));
        }
    }

    /// Close every client socket server-side, simulating a connection drop.
    pub fn drop_all_clients(&self) {
        for client in self.clients.lock().unwrap().drain(..) {
            let _ = client.send(ServerCmd::Close);
        }
    }
}

/// Poll `predicate` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
