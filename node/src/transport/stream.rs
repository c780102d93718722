use super::{Address, Incoming, PeerHandle, Server, Session, SHUTDOWN_SENTINEL};
use crate::error::TransportError;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const QUEUE_DEPTH: usize = 256;

type Connections = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>>;

fn to_message(payload: &[u8]) -> Message {
    match std::str::from_utf8(payload) {
        Ok(text) => Message::Text(text.to_string()),
        Err(_) => Message::Binary(payload.to_vec()),
    }
}

/// WebSocket server keeping a registry of live connections.
pub struct StreamServer {
    local: Address,
    connections: Connections,
    connected: Arc<watch::Sender<usize>>,
    inbox: Mutex<mpsc::Receiver<Incoming>>,
    shutdown: Shutdown,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl StreamServer {
    pub async fn bind(address: &Address) -> Result<Self, TransportError> {
        let target = address.resolve().await?;
        let listener = TcpListener::bind(target).await.map_err(|e| TransportError::Bind {
            address: address.clone(),
            reason: e.to_string(),
        })?;
        let local = Address::from(listener.local_addr()?);

        let connections: Connections = Arc::new(Mutex::new(HashMap::new()));
        let (connected, _) = watch::channel(0usize);
        let connected = Arc::new(connected);
        let (inbox_tx, inbox_rx) = mpsc::channel(QUEUE_DEPTH);
        let shutdown = Shutdown::new();

        let acceptor = tokio::spawn(accept_loop(
            listener,
            connections.clone(),
            connected.clone(),
            inbox_tx,
            shutdown.clone(),
        ));

        Ok(Self {
            local,
            connections,
            connected,
            inbox: Mutex::new(inbox_rx),
            shutdown,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    connections: Connections,
    connected: Arc<watch::Sender<usize>>,
    inbox: mpsc::Sender<Incoming>,
    shutdown: Shutdown,
) {
    let mut next_id = 0u64;
    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };
        next_id += 1;
        tokio::spawn(serve_connection(
            next_id,
            stream,
            remote,
            connections.clone(),
            connected.clone(),
            inbox.clone(),
            shutdown.clone(),
        ));
    }
}

async fn serve_connection(
    id: u64,
    stream: TcpStream,
    remote: SocketAddr,
    connections: Connections,
    connected: Arc<watch::Sender<usize>>,
    inbox: mpsc::Sender<Incoming>,
    shutdown: Shutdown,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", remote, e);
            return;
        }
    };
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let mut registry = connections.lock().await;
        registry.insert(id, tx);
        connected.send_replace(registry.len());
    }
    info!("Stream peer {} connected from {}", id, remote);

    let peer = PeerHandle::Stream(id);
    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                let _ = sink.send(Message::Text(SHUTDOWN_SENTINEL.to_string())).await;
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Some(outgoing) = rx.recv() => {
                if let Err(e) = sink.send(outgoing).await {
                    warn!("Send to stream peer {} failed: {}", id, e);
                    break;
                }
            }
            frame = source.next() => {
                let payload = match frame {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Stream peer {} failed: {}", id, e);
                        break;
                    }
                };
                let incoming = Incoming::Message { peer: peer.clone(), payload };
                if inbox.send(incoming).await.is_err() {
                    break;
                }
            }
        }
    }

    {
        let mut registry = connections.lock().await;
        registry.remove(&id);
        connected.send_replace(registry.len());
    }
    debug!("Stream peer {} disconnected", id);
    if !shutdown.is_triggered() {
        let _ = inbox.send(Incoming::Disconnected { peer }).await;
    }
}

#[async_trait]
impl Server for StreamServer {
    fn local_address(&self) -> Address {
        self.local.clone()
    }

    async fn receive(&self) -> Result<Option<Incoming>, TransportError> {
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            _ = self.shutdown.wait() => Ok(None),
            incoming = inbox.recv() => Ok(incoming),
        }
    }

    async fn send(&self, peer: &PeerHandle, payload: &[u8]) -> Result<usize, TransportError> {
        let id = match peer {
            PeerHandle::Stream(id) => *id,
            _ => return Err(TransportError::PeerUnknown(peer.clone())),
        };
        let registry = self.connections.lock().await;
        let outgoing = registry
            .get(&id)
            .ok_or_else(|| TransportError::PeerUnknown(peer.clone()))?;
        outgoing
            .send(to_message(payload))
            .map_err(|_| TransportError::PeerUnknown(peer.clone()))?;
        Ok(payload.len())
    }

    async fn wait_for_peers(&self, count: usize) {
        let mut connected = self.connected.subscribe();
        tokio::select! {
            _ = self.shutdown.wait() => {}
            _ = connected.wait_for(|n| *n >= count) => {}
        }
    }

    async fn close(&self) {
        self.shutdown.trigger();
        if let Some(acceptor) = self.acceptor.lock().await.take() {
            let _ = acceptor.await;
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client session.
pub struct StreamSession {
    remote: Address,
    sink: Mutex<SplitSink<WsStream, Message>>,
    source: Mutex<SplitStream<WsStream>>,
    shutdown: Shutdown,
}

impl StreamSession {
    pub async fn connect(address: &Address) -> Result<Self, TransportError> {
        let url = format!("ws://{}:{}/", address.host, address.port);
        let (ws, _response) = connect_async(url).await?;
        let (sink, source) = ws.split();

        Ok(Self {
            remote: address.clone(),
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            shutdown: Shutdown::new(),
        })
    }
}

#[async_trait]
impl Session for StreamSession {
    fn remote_address(&self) -> &Address {
        &self.remote
    }

    async fn send(&self, payload: &[u8]) -> Result<usize, TransportError> {
        self.sink.lock().await.send(to_message(payload)).await?;
        Ok(payload.len())
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut source = self.source.lock().await;
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.wait() => return Ok(None),
                frame = source.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) if text == SHUTDOWN_SENTINEL => {
                    debug!("Server at {} announced shutdown", self.remote);
                    return Ok(None);
                }
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&self) {
        self.shutdown.trigger();
        if let Err(e) = self.sink.lock().await.close().await {
            debug!("Closing stream to {} failed: {}", self.remote, e);
        }
    }
}
