//! Length-prefixed framing over a duplex byte stream.
//!
//! ```text
//! [i32 BE: len][payload bytes of len]
//! ```
//!
//! A zero length is a legitimate empty message. End of stream before any
//! header byte is the peer closing the channel; end of stream anywhere else
//! is a framing error.

use bytes::{BufMut, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::config::PipeConfig;
use crate::error::{PipeError, Result};

/// Any duplex byte stream a [`FramedStream`] can run over.
pub trait PipeIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<S> PipeIo for S where S: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedIo = Box<dyn PipeIo>;

/// Encode one frame into a single buffer.
pub fn encode_frame(payload: &[u8], max_message_size: usize) -> Result<BytesMut> {
    let max = max_message_size.min(i32::MAX as usize);
    if payload.len() > max {
        return Err(PipeError::MessageTooLarge {
            size: payload.len(),
            max,
        });
    }

    let mut buf = BytesMut::with_capacity(PipeConfig::FRAME_HEADER_LEN + payload.len());
    buf.put_i32(payload.len() as i32);
    buf.put_slice(payload);
    Ok(buf)
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` when the peer closed the stream before sending a header.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_message_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; PipeConfig::FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(PipeError::framing(format!(
                "stream closed after {} of {} header bytes",
                filled,
                header.len()
            )));
        }
        filled += n;
    }

    let len = i32::from_be_bytes(header);
    if len < 0 {
        return Err(PipeError::framing(format!("negative frame length {}", len)));
    }
    let len = len as usize;
    if len > max_message_size {
        return Err(PipeError::MessageTooLarge {
            size: len,
            max: max_message_size,
        });
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(PipeError::framing(
            format!("stream closed inside a {} byte payload", len),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    max_message_size: usize,
) -> Result<()> {
    let frame = encode_frame(payload, max_message_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// A duplex stream carrying discrete byte messages.
///
/// Reads and writes use separate halves so a read loop and any number of
/// writers can run at once. Writers share one lock, so frames never
/// interleave on the wire.
pub struct FramedStream {
    reader: Mutex<ReadHalf<BoxedIo>>,
    writer: Mutex<WriteHalf<BoxedIo>>,
    connected: AtomicBool,
    max_message_size: usize,
}

impl FramedStream {
    /// Wrap a connected stream.
    pub fn new(io: impl PipeIo) -> Self {
        Self::with_max_message_size(io, PipeConfig::MAX_MESSAGE_SIZE)
    }

    /// Wrap a connected stream with a custom payload limit.
    pub fn with_max_message_size(io: impl PipeIo, max_message_size: usize) -> Self {
        let boxed: BoxedIo = Box::new(io);
        let (reader, writer) = tokio::io::split(boxed);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            connected: AtomicBool::new(true),
            max_message_size,
        }
    }

    /// Whether the channel is still believed to be open.
    ///
    /// Cleared by a clean end of stream, a broken-pipe write, or `close()`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Read the next message.
    ///
    /// `Ok(None)` means the peer closed the channel and the stream is now
    /// disconnected. `Ok(Some(vec![]))` is an empty message and leaves the
    /// stream connected.
    pub async fn read(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        match read_frame(&mut *reader, self.max_message_size).await {
            Ok(None) => {
                self.connected.store(false, Ordering::SeqCst);
                Ok(None)
            }
            Ok(Some(payload)) => Ok(Some(payload)),
            Err(e) => {
                if e.is_fatal_to_channel() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    /// Write one message.
    pub async fn write(&self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload, self.max_message_size)?;

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.wait_for_drain().await;
                Ok(())
            }
            Err(e) => {
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::NotConnected
                ) {
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(e.into())
            }
        }
    }

    /// Wait until the peer has consumed what was written.
    ///
    /// Neither Unix sockets nor tokio's named pipes expose a drain primitive,
    /// so this returns immediately.
    async fn wait_for_drain(&self) {}

    /// Mark the stream closed and signal end of stream to the peer.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for FramedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedStream")
            .field("connected", &self.is_connected())
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}
