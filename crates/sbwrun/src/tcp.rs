//! # TCP Transport
//!
//! Frames are written as `[Len: 4b BE][Payload: Len]` over a TCP stream.

use std::net::SocketAddr;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::sync::watch;

use crate::transport;
use crate::transport::Error;
use crate::transport::Transport;

pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    max_frame_len: usize,
    closed: watch::Sender<bool>,
    peer_addr: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, max_frame_len: usize) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_frame_len,
            closed: watch::Sender::new(false),
            peer_addr,
        }
    }

    /// Connects to `addr`, e.g. `"127.0.0.1:10102"`.
    pub async fn connect(addr: &str, max_frame_len: usize) -> transport::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ConnectionLost(format!("cannot reach {}: {}", addr, e)))?;
        Ok(Self::new(stream, max_frame_len))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    async fn read_frame(reader: &mut OwnedReadHalf, max: usize) -> transport::Result<Option<Vec<u8>>> {
        let mut len = [0u8; 4];
        // EOF on a frame boundary is a clean close.
        match reader.read_exact(&mut len).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len) as usize;
        if len > max {
            return Err(Error::PayloadTooLarge { len, max });
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        if payload.len() > self.max_frame_len {
            return Err(Error::PayloadTooLarge { len: payload.len(), max: self.max_frame_len });
        }
        if *self.closed.borrow() {
            return Err(Error::ConnectionLost("transport closed".into()));
        }

        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(Error::ConnectionLost("transport closed".into()));
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = closed.wait_for(|c| *c) => Err(Error::ConnectionLost("transport closed".into())),
            res = Self::read_frame(&mut reader, self.max_frame_len) => res,
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Accepts framed TCP connections.
pub struct TcpAcceptor {
    inner: TcpListener,
    max_frame_len: usize,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str, max_frame_len: usize) -> transport::Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Io(format!("cannot listen on {}: {}", addr, e)))?;
        Ok(Self { inner, max_frame_len })
    }

    pub fn local_addr(&self) -> transport::Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub async fn accept(&self) -> transport::Result<(TcpTransport, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await?;
        Ok((TcpTransport::new(stream, self.max_frame_len), addr))
    }
}
