//! Byte transport to the modem and the listener task that drains it.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const READ_CHUNK: usize = 512;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("socket io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connecting to {0} timed out")]
    Timeout(String),

    #[error("{0} can only be opened once")]
    Exhausted(String),

    #[error("connection closed")]
    Closed,
}

pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens a fresh byte stream to the modem. Called again on every reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<(ByteReader, ByteWriter), ConnectionError>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self) -> Result<(ByteReader, ByteWriter), ConnectionError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(self.addr.as_str()))
            .await
            .map_err(|_| ConnectionError::Timeout(self.addr.clone()))??;
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();
        Ok((Box::new(r), Box::new(w)))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Hands out a single pre-built stream; later opens fail. Used with in-memory pipes.
pub struct OneShotConnector<S> {
    name: String,
    stream: Mutex<Option<S>>,
}

impl<S> OneShotConnector<S> {
    pub fn new(name: impl Into<String>, stream: S) -> Self {
        Self {
            name: name.into(),
            stream: Mutex::new(Some(stream)),
        }
    }
}

#[async_trait]
impl<S> Connector for OneShotConnector<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn open(&self) -> Result<(ByteReader, ByteWriter), ConnectionError> {
        let stream = self
            .stream
            .lock()
            .map_err(|_| ConnectionError::Exhausted(self.name.clone()))?
            .take()
            .ok_or_else(|| ConnectionError::Exhausted(self.name.clone()))?;
        let (r, w) = tokio::io::split(stream);
        Ok((Box::new(r), Box::new(w)))
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// What the listener passes to the driver loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxChunk {
    Data(Bytes),
    Closed,
    Failed(String),
}

/// Reads until EOF, error or cancellation, forwarding chunks over a bounded channel.
async fn listen(mut reader: ByteReader, tx: mpsc::Sender<RxChunk>, cancel: CancellationToken) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        let chunk = match read {
            Ok(0) => RxChunk::Closed,
            Ok(n) => RxChunk::Data(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => RxChunk::Failed(e.to_string()),
        };
        let last = !matches!(chunk, RxChunk::Data(_));
        if tx.send(chunk).await.is_err() || last {
            break;
        }
    }
    debug!("listener stopped");
}

/// An open modem link: the write half plus the listener draining the read half.
pub struct Connection {
    writer: ByteWriter,
    rx: mpsc::Receiver<RxChunk>,
    cancel: CancellationToken,
    listener: JoinHandle<()>,
}

impl Connection {
    pub async fn open(connector: &dyn Connector, capacity: usize) -> Result<Self, ConnectionError> {
        let (reader, writer) = connector.open().await?;
        info!("connected to modem at {}", connector.describe());
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(listen(reader, tx, cancel.clone()));
        Ok(Self {
            writer,
            rx,
            cancel,
            listener,
        })
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> RxChunk {
        self.rx.recv().await.unwrap_or(RxChunk::Closed)
    }

    /// Stops the listener and waits for it before shutting the write half.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.listener).await {
            warn!("listener task ended abnormally: {}", e);
        }
        if let Err(e) = self.writer.shutdown().await {
            debug!("shutdown after close: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn chunks_then_closed() {
        let mock = tokio_test::io::Builder::new().read(b"OK\r\n").read(b"EMPTY\r\n").build();
        let connector = OneShotConnector::new("mock", mock);
        let mut conn = Connection::open(&connector, 4).await.unwrap();

        let mut data = Vec::new();
        loop {
            match conn.recv().await {
                RxChunk::Data(b) => data.extend_from_slice(&b),
                RxChunk::Closed => break,
                RxChunk::Failed(e) => panic!("{e}"),
            }
        }
        assert_eq!(data, b"OK\r\nEMPTY\r\n");
        assert!(matches!(connector.open().await, Err(ConnectionError::Exhausted(_))));
    }

    #[tokio::test]
    async fn write_reaches_peer_and_close_stops_listener() {
        let (ours, mut theirs) = duplex(64);
        let connector = OneShotConnector::new("pipe", ours);
        let mut conn = Connection::open(&connector, 4).await.unwrap();

        conn.write(b"AT?DI\r\n").await.unwrap();
        let mut buf = [0u8; 7];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"AT?DI\r\n");

        theirs.write_all(b"EMPTY\r\n").await.unwrap();
        assert_eq!(conn.recv().await, RxChunk::Data(Bytes::from_static(b"EMPTY\r\n")));

        // listener is blocked in read; cancellation must still end it
        conn.close().await;
    }

    #[tokio::test]
    async fn refused_tcp_connect_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let connector = TcpConnector::new(addr.to_string()).with_timeout(Duration::from_secs(1));
        assert!(connector.open().await.is_err());
    }
}
