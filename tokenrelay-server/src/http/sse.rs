use async_trait::async_trait;
use axum::{body::Body, http::StatusCode, response::Response};
use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use std::{convert::Infallible, fmt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::delivery::{EventSink, Flush, SinkClosed, SseFrame};

/// Flushed chunks buffered between the delivery loop and hyper.
const BODY_BUFFER: usize = 16;

/// [`EventSink`] feeding a streaming response body.
///
/// Frames accumulate until `flush`, which hands them to the body as one chunk.
pub struct ChannelSink {
    sender: mpsc::Sender<Bytes>,
    pending: String,
}

impl fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSink")
            .field("pending", &self.pending.len())
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

#[async_trait]
impl Flush for ChannelSink {
    async fn flush(&mut self) -> Result<(), SinkClosed> {
        if self.pending.is_empty() {
            return if self.sender.is_closed() {
                Err(SinkClosed)
            } else {
                Ok(())
            };
        }
        let chunk = Bytes::from(std::mem::take(&mut self.pending));
        self.sender.send(chunk).await.map_err(|_| SinkClosed)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn write_frame(&mut self, frame: &SseFrame) -> Result<(), SinkClosed> {
        if self.sender.is_closed() {
            return Err(SinkClosed);
        }
        self.pending.push_str(&frame.encode());
        Ok(())
    }
}

/// Builds an SSE response and the sink that writes into it.
///
/// `disconnect` is cancelled as soon as the response body is dropped, which is how a
/// client going away reaches the delivery loop.
///
/// # Errors
/// Returns [`http::Error`] if the response cannot be assembled.
pub fn event_stream(disconnect: &CancellationToken) -> Result<(ChannelSink, Response), http::Error> {
    let (sender, receiver) = mpsc::channel::<Bytes>(BODY_BUFFER);
    let guard = disconnect.clone().drop_guard();
    let stream = ReceiverStream::new(receiver).map(move |chunk| {
        let _held = &guard;
        Ok::<_, Infallible>(chunk)
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header(CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))?;

    Ok((
        ChannelSink {
            sender,
            pending: String::new(),
        },
        response,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_reach_the_body_only_after_flush() {
        let disconnect = CancellationToken::new();
        let (mut sink, response) = event_stream(&disconnect).unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()["x-accel-buffering"], "no");

        sink.write_frame(&SseFrame::keep_alive()).await.unwrap();
        sink.write_frame(&SseFrame::comment("second")).await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b": keep-alive\n\n: second\n\n");
    }

    #[tokio::test]
    async fn dropping_the_body_cancels_and_closes_the_sink() {
        let disconnect = CancellationToken::new();
        let (mut sink, response) = event_stream(&disconnect).unwrap();
        drop(response);

        assert!(disconnect.is_cancelled());
        assert_eq!(
            sink.write_frame(&SseFrame::keep_alive()).await,
            Err(SinkClosed)
        );
        assert_eq!(sink.flush().await, Err(SinkClosed));
    }
}
