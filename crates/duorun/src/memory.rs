//! In-process sockets built on tokio channels.
//!
//! Used by the test suite, and by hosts that embed client and server in one
//! process.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::transport;
use crate::transport::Acceptor;
use crate::transport::Connector;
use crate::transport::Inbound;
use crate::transport::PeerInfo;
use crate::transport::Socket;

/// One end of an in-memory duplex pair.
///
/// Frames sent on one end appear on the other end's `recv`, in order.
pub struct MemorySocket {
    tx: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Inbound>>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for MemorySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySocket").field("closed", &self.is_closed()).finish_non_exhaustive()
    }
}

impl MemorySocket {
    /// Creates two sockets connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }

    fn new(tx: mpsc::UnboundedSender<Inbound>, rx: mpsc::UnboundedReceiver<Inbound>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            closed: watch::Sender::new(false),
        }
    }

    /// Sends a text frame. Text carries no RPC traffic.
    pub async fn send_text(&self, text: &str) -> transport::Result<()> {
        self.push(Inbound::Text(text.to_string()))
    }

    fn push(&self, frame: Inbound) -> transport::Result<()> {
        if self.is_closed() {
            return Err(transport::Error::Closed);
        }
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| transport::Error::ConnectionLost("peer closed".into())),
            None => Err(transport::Error::Closed),
        }
    }
}

#[async_trait::async_trait]
impl Socket for MemorySocket {
    async fn send(&self, bytes: &[u8]) -> transport::Result<()> {
        self.push(Inbound::Binary(bytes.to_vec()))
    }

    async fn recv(&self) -> transport::Result<Option<Inbound>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => Ok(frame),
            _ = closed.wait_for(|c| *c) => Ok(None),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        // Dropping our sender ends the peer's stream once it has drained.
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        // Closing our receiver makes the peer's sends fail.
        self.rx.lock().await.close();
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Creates a connected acceptor/connector pair.
///
/// Each `connect` creates a new `MemorySocket` pair and hands one end to the
/// acceptor. The acceptor yields `None` once every connector has been dropped.
pub fn listener() -> (MemoryAcceptor, MemoryConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    let acceptor = MemoryAcceptor { incoming: AsyncMutex::new(rx) };
    let connector = MemoryConnector { outgoing: tx, next_port: Arc::new(AtomicU64::new(1)) };
    (acceptor, connector)
}

pub struct MemoryAcceptor {
    incoming: AsyncMutex<mpsc::UnboundedReceiver<(Arc<dyn Socket>, PeerInfo)>>,
}

#[async_trait::async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&self) -> transport::Result<Option<(Arc<dyn Socket>, PeerInfo)>> {
        Ok(self.incoming.lock().await.recv().await)
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    outgoing: mpsc::UnboundedSender<(Arc<dyn Socket>, PeerInfo)>,
    next_port: Arc<AtomicU64>,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> transport::Result<Arc<dyn Socket>> {
        let (local, remote) = MemorySocket::pair();
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let peer = PeerInfo::new(format!("memory:{}", port));
        self.outgoing
            .send((Arc::new(remote), peer))
            .map_err(|_| transport::Error::ConnectionLost("acceptor dropped".into()))?;
        Ok(Arc::new(local))
    }
}
