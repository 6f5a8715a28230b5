//! Connection handling for RelayNet
//!
//! Splits an established stream into:
//! - a [`FrameReader`] owned by the connection's read loop
//! - a [`Transmitter`] shared by everything that writes to the peer

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use super::transmitter::{Channel, Transmitter};
use crate::context::ProtocolContext;
use crate::protocol::{CodecError, Decoder, Frame};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(#[from] super::TlsError),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[from] native_tls::Error),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Read-side statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub frames_received: u64,
    pub bytes_received: u64,
}

/// Read half of a connection, decoding frames as they arrive
pub struct FrameReader {
    remote_addr: SocketAddr,
    reader: BoxedReader,
    decoder: Decoder,
    read_buf: BytesMut,
    last_activity: Instant,
    stats: ConnectionStats,
}

impl FrameReader {
    pub fn new(remote_addr: SocketAddr, reader: BoxedReader, decoder: Decoder) -> Self {
        Self {
            remote_addr,
            reader,
            decoder,
            read_buf: BytesMut::with_capacity(4096),
            last_activity: Instant::now(),
            stats: ConnectionStats::default(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Receive the next admitted frame; `None` on a clean close
    pub async fn recv(&mut self) -> ConnectionResult<Option<Frame>> {
        loop {
            // Try to decode a frame from the buffer
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.frames_received += 1;
                self.last_activity = Instant::now();
                return Ok(Some(frame));
            }

            // Read more data
            let n = self.reader.read_buf(&mut self.read_buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None); // Clean close
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.stats.bytes_received += n as u64;
        }
    }

    /// Try to receive a frame with a timeout
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Option<Frame>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Get time since last inbound frame
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Split `stream` into its reader and transmitter halves
pub fn open<S>(
    stream: S,
    remote_addr: SocketAddr,
    context: &ProtocolContext,
) -> (FrameReader, Transmitter)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let channel = Arc::new(Channel::new(remote_addr, Box::new(write_half)));

    (
        FrameReader::new(remote_addr, Box::new(read_half), context.decoder()),
        Transmitter::new(channel, context.encoder()),
    )
}
