use super::{Address, Incoming, PeerHandle, Server, Session, SHUTDOWN_SENTINEL};
use crate::error::TransportError;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use zeromq::{DealerSocket, Endpoint, RouterSocket, Socket, SocketRecv, SocketSend, ZmqError, ZmqMessage};

const QUEUE_DEPTH: usize = 256;

fn endpoint(address: &Address) -> String {
    let host = address
        .ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| address.host.clone());
    format!("tcp://{}:{}", host, address.port)
}

struct Outbound {
    message: ZmqMessage,
    ack: oneshot::Sender<Result<(), ZmqError>>,
}

async fn enqueue(outbox: &mpsc::Sender<Outbound>, message: ZmqMessage) -> Result<(), TransportError> {
    let (ack, done) = oneshot::channel();
    outbox
        .send(Outbound { message, ack })
        .await
        .map_err(|_| TransportError::Closed)?;
    done.await.map_err(|_| TransportError::Closed)??;
    Ok(())
}

/// ROUTER socket. Each dealer is addressed by the identity frame the router assigned it.
pub struct BrokerServer {
    local: Address,
    outbox: mpsc::Sender<Outbound>,
    inbox: Mutex<mpsc::Receiver<Incoming>>,
    peers: Arc<Mutex<HashSet<Vec<u8>>>>,
    shutdown: Shutdown,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerServer {
    pub async fn bind(address: &Address) -> Result<Self, TransportError> {
        let mut socket = RouterSocket::new();
        let bound = socket
            .bind(&endpoint(address))
            .await
            .map_err(|e| TransportError::Bind {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let local = match bound {
            Endpoint::Tcp(_, port) => address.with_port(port),
            _ => address.clone(),
        };

        let (outbox_tx, outbox_rx) = mpsc::channel(QUEUE_DEPTH);
        let (inbox_tx, inbox_rx) = mpsc::channel(QUEUE_DEPTH);
        let peers = Arc::new(Mutex::new(HashSet::new()));
        let shutdown = Shutdown::new();
        let pump = tokio::spawn(pump_router(
            socket,
            outbox_rx,
            inbox_tx,
            peers.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            local,
            outbox: outbox_tx,
            inbox: Mutex::new(inbox_rx),
            peers,
            shutdown,
            pump: Mutex::new(Some(pump)),
        })
    }
}

async fn pump_router(
    mut socket: RouterSocket,
    mut outbox: mpsc::Receiver<Outbound>,
    inbox: mpsc::Sender<Incoming>,
    peers: Arc<Mutex<HashSet<Vec<u8>>>>,
    shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            Some(out) = outbox.recv() => {
                let result = socket.send(out.message).await;
                let _ = out.ack.send(result);
            }
            received = socket.recv() => {
                let mut frames = match received {
                    Ok(message) => message.into_vec(),
                    Err(e) => {
                        error!("Router receive failed: {}", e);
                        break;
                    }
                };
                if frames.len() < 2 {
                    warn!("Discarding router message with {} frames", frames.len());
                    continue;
                }
                let identity = frames.remove(0).to_vec();
                let payload = frames.pop().map(|frame| frame.to_vec()).unwrap_or_default();
                peers.lock().await.insert(identity.clone());

                let incoming = Incoming::Message {
                    peer: PeerHandle::Broker(identity),
                    payload,
                };
                if inbox.send(incoming).await.is_err() {
                    break;
                }
            }
        }
    }

    let known: Vec<Vec<u8>> = peers.lock().await.iter().cloned().collect();
    for identity in known {
        let mut farewell = ZmqMessage::from(Bytes::from_static(SHUTDOWN_SENTINEL.as_bytes()));
        farewell.push_front(Bytes::from(identity));
        if let Err(e) = socket.send(farewell).await {
            debug!("Shutdown notice not delivered: {}", e);
        }
    }
    socket.close().await;
}

#[async_trait]
impl Server for BrokerServer {
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
        let identity = match peer {
            PeerHandle::Broker(identity) => identity.clone(),
            _ => return Err(TransportError::PeerUnknown(peer.clone())),
        };
        if !self.peers.lock().await.contains(&identity) {
            return Err(TransportError::PeerUnknown(peer.clone()));
        }
        let mut message = ZmqMessage::from(Bytes::copy_from_slice(payload));
        message.push_front(Bytes::from(identity));
        enqueue(&self.outbox, message).await?;
        Ok(payload.len())
    }

    async fn forget(&self, peer: &PeerHandle) {
        if let PeerHandle::Broker(identity) = peer {
            self.peers.lock().await.remove(identity);
        }
    }

    async fn close(&self) {
        self.shutdown.trigger();
        if let Some(pump) = self.pump.lock().await.take() {
            let _ = pump.await;
        }
    }
}

/// DEALER socket connected to one router.
pub struct BrokerSession {
    remote: Address,
    outbox: mpsc::Sender<Outbound>,
    inbox: Mutex<mpsc::Receiver<Vec<u8>>>,
    shutdown: Shutdown,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerSession {
    pub async fn connect(address: &Address) -> Result<Self, TransportError> {
        let mut socket = DealerSocket::new();
        socket.connect(&endpoint(address)).await?;

        let (outbox_tx, outbox_rx) = mpsc::channel(QUEUE_DEPTH);
        let (inbox_tx, inbox_rx) = mpsc::channel(QUEUE_DEPTH);
        let shutdown = Shutdown::new();
        let pump = tokio::spawn(pump_dealer(socket, outbox_rx, inbox_tx, shutdown.clone()));

        Ok(Self {
            remote: address.clone(),
            outbox: outbox_tx,
            inbox: Mutex::new(inbox_rx),
            shutdown,
            pump: Mutex::new(Some(pump)),
        })
    }
}

async fn pump_dealer(
    mut socket: DealerSocket,
    mut outbox: mpsc::Receiver<Outbound>,
    inbox: mpsc::Sender<Vec<u8>>,
    shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            Some(out) = outbox.recv() => {
                let result = socket.send(out.message).await;
                let _ = out.ack.send(result);
            }
            received = socket.recv() => {
                let payload = match received {
                    Ok(message) => message.into_vec().pop().map(|frame| frame.to_vec()).unwrap_or_default(),
                    Err(e) => {
                        error!("Dealer receive failed: {}", e);
                        break;
                    }
                };
                if payload == SHUTDOWN_SENTINEL.as_bytes() {
                    debug!("Router announced shutdown");
                    break;
                }
                if inbox.send(payload).await.is_err() {
                    break;
                }
            }
        }
    }
    socket.close().await;
}

#[async_trait]
impl Session for BrokerSession {
    fn remote_address(&self) -> &Address {
        &self.remote
    }

    async fn send(&self, payload: &[u8]) -> Result<usize, TransportError> {
        enqueue(&self.outbox, ZmqMessage::from(Bytes::copy_from_slice(payload))).await?;
        Ok(payload.len())
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            _ = self.shutdown.wait() => Ok(None),
            payload = inbox.recv() => Ok(payload),
        }
    }

    async fn close(&self) {
        self.shutdown.trigger();
        if let Some(pump) = self.pump.lock().await.take() {
            let _ = pump.await;
        }
    }
}
