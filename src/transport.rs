//! Framed connection over any async byte stream (TCP in production, duplex
//! pipes in tests).

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::error::{Result, SyncError, WireError};
use crate::protocol::timeouts::{write_deadline_ms, CONNECT_MS};
use crate::protocol::{frame, HEADER_LEN};
use crate::protocol_core::{build_frame_header, parse_frame_header};
use crate::transfer::{ChunkSink, ChunkSource};
use crate::wire::{self, FileBytesMessage};

pub struct FramedConn<S> {
    stream: S,
    idle_ms: u64,
}

impl<S> FramedConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, idle_ms: u64) -> Self {
        Self { stream, idle_ms }
    }

    pub async fn write_frame(&mut self, t: u8, payload: &[u8]) -> Result<()> {
        let ms = write_deadline_ms(payload.len());
        let hdr = build_frame_header(t, payload.len() as u32);
        let stream = &mut self.stream;
        match timeout(Duration::from_millis(ms), async {
            stream.write_all(&hdr).await?;
            if !payload.is_empty() {
                stream.write_all(payload).await?;
            }
            stream.flush().await
        })
        .await
        {
            Ok(result) => result.map_err(SyncError::Io),
            Err(_) => Err(SyncError::Timeout(ms)),
        }
    }

    pub async fn send<T: Serialize>(&mut self, t: u8, value: &T) -> Result<()> {
        let payload = wire::encode(value)?;
        self.write_frame(t, &payload).await
    }

    pub async fn send_error(&mut self, err: &SyncError) -> Result<()> {
        self.send(frame::ERROR, &WireError::from(err)).await
    }

    /// Read one frame. `None` means the peer closed cleanly at a frame boundary.
    pub async fn read_frame_opt(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        let ms = self.idle_ms;
        match timeout(Duration::from_millis(ms), self.read_frame_inner()).await {
            Ok(res) => res,
            Err(_) => Err(SyncError::Timeout(ms)),
        }
    }

    async fn read_frame_inner(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        let mut hdr = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = self
                .stream
                .read(&mut hdr[filled..])
                .await
                .map_err(SyncError::from_read)?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(SyncError::Disconnected(
                    "connection closed inside frame header".to_string(),
                ));
            }
            filled += n;
        }
        let (typ, len) = parse_frame_header(&hdr)?;
        let mut payload = vec![0u8; len as usize];
        if len > 0 {
            self.stream
                .read_exact(&mut payload)
                .await
                .map_err(SyncError::from_read)?;
        }
        Ok(Some((typ, payload)))
    }

    /// Read one frame; EOF is a disconnection.
    pub async fn read_frame(&mut self) -> Result<(u8, Vec<u8>)> {
        self.read_frame_opt()
            .await?
            .ok_or_else(|| SyncError::Disconnected("connection closed by peer".to_string()))
    }

    /// Read a frame of the expected type. An ERROR frame becomes the remote error.
    pub async fn expect_frame(&mut self, expected: u8) -> Result<Vec<u8>> {
        let (typ, payload) = self.read_frame().await?;
        check_frame(typ, expected, payload)
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

fn check_frame(typ: u8, expected: u8, payload: Vec<u8>) -> Result<Vec<u8>> {
    if typ == expected {
        return Ok(payload);
    }
    if typ == frame::ERROR {
        let err: WireError = wire::decode(&payload)?;
        return Err(err.into());
    }
    Err(SyncError::Protocol(format!(
        "expected {} frame, got {}",
        frame::name(expected),
        frame::name(typ)
    )))
}

#[async_trait]
impl<S> ChunkSink for FramedConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_chunk(&mut self, msg: &FileBytesMessage) -> Result<()> {
        self.send(frame::CHUNK, msg).await
    }
}

#[async_trait]
impl<S> ChunkSource for FramedConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_chunk(&mut self) -> Result<Option<FileBytesMessage>> {
        match self.read_frame_opt().await? {
            None => Ok(None),
            Some((typ, payload)) => {
                let payload = check_frame(typ, frame::CHUNK, payload)?;
                Ok(Some(wire::decode(&payload)?))
            }
        }
    }
}

pub async fn connect(addr: &str, idle_ms: u64) -> Result<FramedConn<TcpStream>> {
    let stream = match timeout(Duration::from_millis(CONNECT_MS), TcpStream::connect(addr)).await {
        Ok(res) => res?,
        Err(_) => return Err(SyncError::Timeout(CONNECT_MS)),
    };
    let _ = stream.set_nodelay(true);
    Ok(FramedConn::new(stream, idle_ms))
}
