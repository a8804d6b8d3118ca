use async_trait::async_trait;
use thiserror::Error;

use super::frame::SseFrame;

/// The client transport is gone; nothing more can be written.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("client transport closed")]
pub struct SinkClosed;

/// Pushes buffered bytes to the client.
#[async_trait]
pub trait Flush: Send {
    async fn flush(&mut self) -> Result<(), SinkClosed>;
}

/// Response writer for one SSE connection.
///
/// Frames may be buffered by `write_frame`; they reach the client on `flush`.
#[async_trait]
pub trait EventSink: Flush {
    async fn write_frame(&mut self, frame: &SseFrame) -> Result<(), SinkClosed>;
}
