//! [`RemotingChannel`]: a bidirectional framed connection with a mutable
//! attribute map (spec §3). One reader task per channel decodes frames;
//! writes are serialized through an internal mutex (spec §5).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::{self, FrameDecoder};
use crate::command::TenuredCommand;
use crate::error::TenuredError;

/// A value stored under a channel attribute key. Mirrors the
/// string/opaque-bytes duality `SPEC_FULL.md` calls for.
#[derive(Debug, Clone)]
pub enum AttrValue {
    Str(String),
    Bytes(Vec<u8>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            AttrValue::Bytes(_) => None,
        }
    }
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

struct ChannelInner {
    id: u64,
    remote_addr: String,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send>>,
    attrs: DashMap<String, AttrValue>,
    closed: AtomicBool,
}

/// A cheap-to-clone handle to one connection. Writes are safe to call
/// concurrently from many holders (they serialize on an internal lock);
/// there is exactly one reader loop per channel, driven by whoever accepted
/// or dialed it (see [`run_reader`]).
#[derive(Clone)]
pub struct RemotingChannel {
    inner: Arc<ChannelInner>,
}

impl RemotingChannel {
    pub fn new(remote_addr: String, writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                remote_addr,
                writer: AsyncMutex::new(writer),
                attrs: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    pub fn attributes(&self) -> &DashMap<String, AttrValue> {
        &self.inner.attrs
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Mark the channel closed. Idempotent. Does not touch the socket; the
    /// reader task tears the transport down when it observes EOF/error, and
    /// this just flips the flag other components (auth gate, correlation
    /// table) check.
    pub fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Write one frame with a send deadline. Fails with [`TenuredError::ChannelClosed`]
    /// if the channel was already marked closed, or a wrapped I/O error
    /// surfaced as `ChannelClosed` on write failure / timeout.
    pub async fn write(&self, cmd: &TenuredCommand, deadline: Duration) -> Result<(), TenuredError> {
        if self.is_closed() {
            return Err(TenuredError::ChannelClosed);
        }
        let mut buf = BytesMut::new();
        codec::encode(cmd, &mut buf)?;

        let fut = async {
            let mut w = self.inner.writer.lock().await;
            w.write_all(&buf).await?;
            w.flush().await
        };

        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_io)) => {
                self.mark_closed();
                Err(TenuredError::ChannelClosed)
            }
            Err(_elapsed) => {
                self.mark_closed();
                Err(TenuredError::ChannelClosed)
            }
        }
    }

    /// Fast-fail: reject further writes and tear the channel down without
    /// further I/O attempts (spec glossary: "Fast-fail").
    pub fn fast_fail(&self) {
        self.mark_closed();
    }

    /// Fast-fail and actually shut the socket down, so the peer observes
    /// EOF instead of a connection that merely stops responding (spec §4.3
    /// "fast-fail-close the channel after flush").
    pub async fn close(&self) {
        self.mark_closed();
        let mut w = self.inner.writer.lock().await;
        let _ = w.shutdown().await;
    }
}

/// Callbacks the reader loop drives. Implemented by [`crate::server::TenuredServer`]
/// on the accept side and by [`crate::client::TenuredClient`] on the dial side.
pub trait ChannelHandler: Send + Sync {
    fn on_message(&self, channel: &RemotingChannel, cmd: TenuredCommand);
    fn on_close(&self, channel: &RemotingChannel);
    fn max_frame_size(&self) -> u32;
}

/// Drive one channel's reader loop until EOF or a protocol error, then call
/// `handler.on_close`. Intended to be spawned as its own task per connection.
pub async fn run_reader<R, H>(channel: RemotingChannel, mut reader: R, handler: Arc<H>)
where
    R: AsyncRead + Unpin + Send,
    H: ChannelHandler + 'static,
{
    let mut decoder = FrameDecoder::new(handler.max_frame_size());
    let mut read_buf = vec![0u8; 64 * 1024];

    loop {
        match decoder.next_frame() {
            Ok(Some(cmd)) => {
                handler.on_message(&channel, cmd);
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(channel = channel.id(), %err, "protocol error, closing channel");
                break;
            }
        }

        match reader.read(&mut read_buf).await {
            Ok(0) => break, // EOF
            Ok(n) => decoder.feed(&read_buf[..n]),
            Err(err) => {
                tracing::debug!(channel = channel.id(), %err, "read error, closing channel");
                break;
            }
        }
    }

    channel.mark_closed();
    handler.on_close(&channel);
}
