//! Transport socket seam.
//!
//! The connection drives an opaque bidirectional byte channel through
//! [`Connector`] and [`Socket`]; socket callbacks arrive as [`SocketEvent`]s
//! on a channel created per connect attempt, so events from a replaced
//! socket can never reach its successor. [`TcpConnector`] is the bundled
//! implementation over `FrameCodec`.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rtm_protocol::{Frame, FrameCodec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, RtmError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Data(Bytes),
    Pong(Bytes),
    /// The socket closed; carries the error text when it failed.
    Closed(Option<String>),
}

/// A connected socket. Calls never block; delivery failures surface as
/// a later [`SocketEvent::Closed`].
pub trait Socket: Send {
    fn send(&mut self, data: Bytes) -> Result<()>;
    fn ping(&mut self, payload: Bytes) -> Result<()>;
    fn disconnect(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        subprotocol: &str,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Result<Box<dyn Socket>>;
}

/// Length-prefixed frames over plain TCP.
#[derive(Debug, Default, Clone)]
pub struct TcpConnector;

struct TcpSocket {
    frames: Option<mpsc::UnboundedSender<Frame>>,
    reader: tokio::task::JoinHandle<()>,
}

impl TcpSocket {
    fn push(&mut self, frame: Frame) -> Result<()> {
        match &self.frames {
            Some(tx) => tx.send(frame).map_err(|_| RtmError::connection_lost()),
            None => Err(RtmError::connection_lost()),
        }
    }
}

impl Socket for TcpSocket {
    fn send(&mut self, data: Bytes) -> Result<()> {
        self.push(Frame::Data(data))
    }

    fn ping(&mut self, payload: Bytes) -> Result<()> {
        self.push(Frame::Ping(payload))
    }

    fn disconnect(&mut self) {
        self.frames = None;
        self.reader.abort();
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn strip_scheme(url: &str) -> &str {
    for scheme in ["tcp://", "wss://", "ws://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            return rest.trim_end_matches('/');
        }
    }
    url
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        url: &str,
        subprotocol: &str,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Result<Box<dyn Socket>> {
        let addr = strip_scheme(url);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RtmError::Http(format!("connect {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        tracing::debug!(%addr, subprotocol, "conn: tcp socket connected");

        let (mut read_half, mut write_half) = stream.into_split();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();

        // Writer: drains outbound frames until the sender side is dropped.
        tokio::spawn(async move {
            let mut codec = FrameCodec;
            let mut buf = BytesMut::new();
            while let Some(frame) = frame_rx.recv().await {
                buf.clear();
                if let Err(e) = codec.encode(frame, &mut buf) {
                    tracing::warn!("conn: dropping unencodable frame: {e}");
                    continue;
                }
                if write_half.write_all(&buf).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let pong_tx = frame_tx.clone();
        let reader = tokio::spawn(async move {
            let mut codec = FrameCodec;
            let mut buf = BytesMut::with_capacity(8 * 1024);
            loop {
                loop {
                    match codec.decode(&mut buf) {
                        Ok(Some(Frame::Data(data))) => {
                            let _ = events.send(SocketEvent::Data(data));
                        }
                        Ok(Some(Frame::Pong(payload))) => {
                            let _ = events.send(SocketEvent::Pong(payload));
                        }
                        Ok(Some(Frame::Ping(payload))) => {
                            let _ = pong_tx.send(Frame::Pong(payload));
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = events.send(SocketEvent::Closed(Some(e.to_string())));
                            return;
                        }
                    }
                }
                match read_half.read_buf(&mut buf).await {
                    Ok(0) => {
                        let _ = events.send(SocketEvent::Closed(None));
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send(SocketEvent::Closed(Some(e.to_string())));
                        return;
                    }
                }
            }
        });

        Ok(Box::new(TcpSocket {
            frames: Some(frame_tx),
            reader,
        }))
    }
}
