//! Outbound side of a connection
//!
//! A [`Transmitter`] is a cheap, clonable handle over one connection's write
//! half. It offers three ways to put a frame on the wire:
//! - [`Transmitter::send`] writes and flushes on the calling task
//! - [`Transmitter::send_serial`] hands the frame to the connection's single
//!   writer task, which writes frames in FIFO order
//! - [`Transmitter::send_pooled`] spawns the write onto the runtime
//!
//! Every variant is a logged no-op when the connection is detached or closed.

use bytes::BytesMut;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{CodecError, Encoder, Frame, Packet};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of a connection
pub struct Channel {
    remote_addr: SocketAddr,
    writer: tokio::sync::Mutex<BoxedWriter>,
    open: AtomicBool,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl Channel {
    pub fn new(remote_addr: SocketAddr, writer: BoxedWriter) -> Self {
        Self {
            remote_addr,
            writer: tokio::sync::Mutex::new(writer),
            open: AtomicBool::new(true),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    async fn write_frame(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;

        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Mark closed without touching the socket
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Shut the write half down. Idempotent.
    pub async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Shutdown of {} failed: {}", self.remote_addr, e);
            }
        }
    }
}

/// Encoder plus channel: the part the writer task and pooled writes share
struct Outbound {
    channel: Arc<Channel>,
    encoder: Encoder,
}

impl Outbound {
    async fn write(&self, frame: &Frame) -> bool {
        if !self.channel.is_open() {
            tracing::warn!(
                "Channel to {} is not open, dropping {}",
                self.channel.remote_addr,
                frame.tag()
            );
            return false;
        }

        let mut buf = BytesMut::with_capacity(128);
        match self.encoder.encode(frame, &mut buf) {
            Ok(()) => {}
            Err(CodecError::NotAdmitted(tag)) => {
                tracing::warn!("Dropped outbound frame: packet tag {} not admitted", tag);
                return false;
            }
            Err(e) => {
                tracing::error!("Failed to encode {}: {}", frame.tag(), e);
                return false;
            }
        }

        match self.channel.write_frame(&buf).await {
            Ok(()) => {
                tracing::debug!("Sent {} to {}", frame.tag(), self.channel.remote_addr);
                true
            }
            Err(e) => {
                tracing::error!("Write to {} failed: {}", self.channel.remote_addr, e);
                self.channel.mark_closed();
                false
            }
        }
    }
}

struct Attached {
    outbound: Arc<Outbound>,
    serial_tx: mpsc::UnboundedSender<Frame>,
    runtime: Handle,
}

/// Clonable send handle for one connection
#[derive(Clone)]
pub struct Transmitter {
    attached: Option<Arc<Attached>>,
}

impl Transmitter {
    /// Attach to a channel. Must be called from within a tokio runtime.
    pub fn new(channel: Arc<Channel>, encoder: Encoder) -> Self {
        let outbound = Arc::new(Outbound { channel, encoder });
        let (serial_tx, mut serial_rx) = mpsc::unbounded_channel::<Frame>();

        let writer = outbound.clone();
        tokio::spawn(async move {
            while let Some(frame) = serial_rx.recv().await {
                writer.write(&frame).await;
            }
        });

        Self {
            attached: Some(Arc::new(Attached {
                outbound,
                serial_tx,
                runtime: Handle::current(),
            })),
        }
    }

    /// A transmitter with no channel; every send is a logged no-op
    pub fn detached() -> Self {
        Self { attached: None }
    }

    fn usable(&self, frame: &Frame) -> Option<&Attached> {
        match &self.attached {
            Some(attached) if attached.outbound.channel.is_open() => Some(attached),
            Some(attached) => {
                tracing::warn!(
                    "Channel to {} is closed, dropping {}",
                    attached.outbound.channel.remote_addr,
                    frame.tag()
                );
                None
            }
            None => {
                tracing::warn!("No channel attached, dropping {}", frame.tag());
                None
            }
        }
    }

    /// Encode, write and flush on the calling task
    pub async fn send(&self, frame: Frame) -> bool {
        match self.usable(&frame) {
            Some(attached) => attached.outbound.write(&frame).await,
            None => false,
        }
    }

    pub async fn send_packet<P: Packet>(&self, packet: P) -> bool {
        self.send(Frame::new(packet)).await
    }

    /// Queue onto the connection's writer task. Frames queued this way are
    /// written in the order they were queued. Safe to call from any thread.
    pub fn send_serial(&self, frame: Frame) -> bool {
        let Some(attached) = self.usable(&frame) else {
            return false;
        };
        match attached.serial_tx.send(frame) {
            Ok(()) => true,
            Err(mpsc::error::SendError(frame)) => {
                tracing::warn!("Writer task is gone, dropping {}", frame.tag());
                false
            }
        }
    }

    /// Spawn the write onto the runtime. No ordering guarantee.
    pub fn send_pooled(&self, frame: Frame) -> bool {
        let Some(attached) = self.usable(&frame) else {
            return false;
        };
        let outbound = attached.outbound.clone();
        attached.runtime.spawn(async move {
            outbound.write(&frame).await;
        });
        true
    }

    /// Runtime the connection lives on; the current one when detached
    pub fn runtime(&self) -> Handle {
        match &self.attached {
            Some(attached) => attached.runtime.clone(),
            None => Handle::current(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.attached
            .as_ref()
            .is_some_and(|attached| attached.outbound.channel.is_open())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.attached
            .as_ref()
            .map(|attached| attached.outbound.channel.remote_addr)
    }

    pub fn channel(&self) -> Option<&Arc<Channel>> {
        self.attached.as_ref().map(|attached| &attached.outbound.channel)
    }

    pub async fn close(&self) {
        if let Some(attached) = &self.attached {
            attached.outbound.channel.close().await;
        }
    }
}

impl std::fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transmitter")
            .field("remote_addr", &self.remote_addr())
            .field("open", &self.is_open())
            .finish()
    }
}

/// How a [`PacketQueue`] hands each frame to its transmitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// [`Transmitter::send`]
    Direct,
    /// [`Transmitter::send_serial`]
    #[default]
    Serial,
    /// [`Transmitter::send_pooled`]
    Pooled,
}

/// Buffers frames and drains them with a fixed gap between sends
pub struct PacketQueue {
    transmitter: Transmitter,
    frames: Mutex<VecDeque<Frame>>,
    sending: AtomicBool,
    pacing: Duration,
}

impl PacketQueue {
    pub fn new(transmitter: Transmitter, pacing: Duration) -> Arc<Self> {
        Arc::new(Self {
            transmitter,
            frames: Mutex::new(VecDeque::new()),
            sending: AtomicBool::new(false),
            pacing,
        })
    }

    pub fn add(&self, frame: Frame) -> &Self {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(frame);
        self
    }

    pub fn add_packet<P: Packet>(&self, packet: P) -> &Self {
        self.add(Frame::new(packet))
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::SeqCst)
    }

    fn pop(&self) -> Option<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Drain the queue now. Returns how many frames were accepted for sending.
    pub async fn send(&self, mode: SendMode) -> usize {
        if self.sending.swap(true, Ordering::SeqCst) {
            tracing::error!("Queue is already sending");
            return 0;
        }
        if self.is_empty() {
            tracing::error!("Cannot start sending because the queue is empty");
            self.sending.store(false, Ordering::SeqCst);
            return 0;
        }

        let mut sent = 0;
        while let Some(frame) = self.pop() {
            let accepted = match mode {
                SendMode::Direct => self.transmitter.send(frame).await,
                SendMode::Serial => self.transmitter.send_serial(frame),
                SendMode::Pooled => self.transmitter.send_pooled(frame),
            };
            if accepted {
                sent += 1;
            }
            tokio::time::sleep(self.pacing).await;
        }

        self.sending.store(false, Ordering::SeqCst);
        tracing::debug!("Queue drained, {} frames sent", sent);
        sent
    }

    /// Drain the queue after `delay`
    pub fn send_delayed(self: &Arc<Self>, delay: Duration, mode: SendMode) -> JoinHandle<usize> {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.send(mode).await
        })
    }
}
