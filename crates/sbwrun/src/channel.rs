//! In-memory transports.
//!
//! Used to wire a module to a broker inside one process, chiefly by tests and by
//! launchers that host modules in-process.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::transport;
use crate::transport::Transport;

/// A duplex channel transport using tokio mpsc channels.
///
/// Messages sent via `send()` appear on the other half's `recv()` and vice versa.
/// Closing one half ends the other half's stream.
pub struct DuplexChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    closed: watch::Sender<bool>,
}

impl DuplexChannelTransport {
    /// Creates a transport from separate tx and rx channels.
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Arc::new(Mutex::new(rx)),
            closed: watch::Sender::new(false),
        }
    }

    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let tx = self.tx.lock().await;
        let tx = tx
            .as_ref()
            .ok_or_else(|| transport::Error::ConnectionLost("Channel closed".into()))?;
        tx.send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(transport::Error::ConnectionLost("Channel closed".into()));
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = closed.wait_for(|c| *c) => Err(transport::Error::ConnectionLost("Channel closed".into())),
            msg = rx.recv() => Ok(msg),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        self.tx.lock().await.take();
    }
}
