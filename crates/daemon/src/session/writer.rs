//! Batched outbound frame writer.
//!
//! Terminal output tends to arrive as many small reads. The writer holds
//! frames in a bounded buffer and decides per write whether to send now or
//! leave it to the periodic flush, trading a few milliseconds of latency on
//! bulk output for far fewer websocket messages. Keystroke echoes and control
//! frames always go out immediately.

use std::time::Duration;

use futures_util::SinkExt;
use thiserror::Error;
use tokio::sync::Mutex;
use webshell_protocol::{Frame, FrameCodec, FrameKind, ProtocolError};

use crate::config::WriterConfig;
use crate::transport::{MessageSink, WsMessage};

/// Upper bound on the final flush and close handshake.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors returned by [`BufferedFrameWriter`].
#[derive(Error, Debug)]
pub enum WriterError {
    /// The writer has been closed.
    #[error("writer is closed")]
    Closed,

    /// A frame could not be encoded.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] ProtocolError),

    /// The underlying connection failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

struct WriterState {
    /// `None` once closed.
    sink: Option<MessageSink>,
    pending: Vec<Frame>,
    /// Encoded size of `pending`.
    buffered: usize,
}

impl WriterState {
    /// Appends a frame, merging it into a preceding data frame.
    fn push(&mut self, frame: Frame) {
        if frame.kind == FrameKind::Data {
            if let Some(last) = self.pending.last_mut() {
                if last.kind == FrameKind::Data {
                    self.buffered += frame.payload.len();
                    last.payload.extend_from_slice(&frame.payload);
                    return;
                }
            }
        }

        self.buffered += frame.encoded_len();
        self.pending.push(frame);
    }
}

/// Buffers outbound frames and writes them to a connection in order.
///
/// Every write and flush goes through one lock, so frames never interleave
/// on the wire and arrive in the order they were written.
pub struct BufferedFrameWriter {
    state: Mutex<WriterState>,
    codec: FrameCodec,
    capacity: usize,
    immediate_threshold: usize,
}

impl BufferedFrameWriter {
    /// Wraps `sink` with the batching policy from `config`.
    pub fn new(sink: MessageSink, config: &WriterConfig) -> Self {
        Self {
            state: Mutex::new(WriterState {
                sink: Some(sink),
                pending: Vec::new(),
                buffered: 0,
            }),
            codec: FrameCodec::new(),
            capacity: config.buffer_size,
            immediate_threshold: config.immediate_threshold,
        }
    }

    /// Queues a frame, flushing when the policy says so.
    ///
    /// The buffer is flushed immediately when the payload is shorter than the
    /// immediate threshold or the buffer is more than half full. A frame that
    /// would overflow the buffer flushes what is already queued first.
    pub async fn write(&self, frame: Frame) -> Result<(), WriterError> {
        let mut state = self.state.lock().await;
        if state.sink.is_none() {
            return Err(WriterError::Closed);
        }

        let immediate = frame.payload.len() < self.immediate_threshold;

        if state.buffered > 0 && state.buffered + frame.encoded_len() > self.capacity {
            self.flush_locked(&mut state).await?;
        }

        state.push(frame);

        if immediate || state.buffered > self.capacity / 2 {
            self.flush_locked(&mut state).await?;
        }

        Ok(())
    }

    /// Sends everything buffered.
    pub async fn flush(&self) -> Result<(), WriterError> {
        let mut state = self.state.lock().await;
        if state.sink.is_none() {
            return Err(WriterError::Closed);
        }
        self.flush_locked(&mut state).await
    }

    /// Sends a transport message after everything buffered.
    pub async fn send_message(&self, message: WsMessage) -> Result<(), WriterError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await?;

        let sink = state.sink.as_mut().ok_or(WriterError::Closed)?;
        sink.send(message).await?;
        Ok(())
    }

    /// Flushes, sends a close notification and closes the connection.
    ///
    /// Bounded by [`CLOSE_TIMEOUT`]. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), WriterError> {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.close_inner()).await {
            Ok(result) => result,
            Err(_) => Err(WriterError::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out closing connection",
            ))),
        }
    }

    async fn close_inner(&self) -> Result<(), WriterError> {
        let mut state = self.state.lock().await;
        if state.sink.is_none() {
            return Ok(());
        }

        let flushed = self.flush_locked(&mut state).await;
        state.pending.clear();
        state.buffered = 0;

        let Some(mut sink) = state.sink.take() else {
            return flushed;
        };
        sink.send(WsMessage::Close).await?;
        sink.close().await?;
        flushed
    }

    /// Returns whether [`BufferedFrameWriter::close`] has run.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.sink.is_none()
    }

    /// Returns the encoded size of the frames waiting to be sent.
    pub async fn buffered(&self) -> usize {
        self.state.lock().await.buffered
    }

    async fn flush_locked(&self, state: &mut WriterState) -> Result<(), WriterError> {
        if state.pending.is_empty() {
            return Ok(());
        }

        let frames = std::mem::take(&mut state.pending);
        state.buffered = 0;

        let sink = state.sink.as_mut().ok_or(WriterError::Closed)?;
        for frame in &frames {
            let bytes = self.codec.encode(frame)?;
            sink.feed(WsMessage::Binary(bytes)).await?;
        }
        sink.flush().await?;

        tracing::trace!(frames = frames.len(), "Flushed outbound frames");
        Ok(())
    }
}
