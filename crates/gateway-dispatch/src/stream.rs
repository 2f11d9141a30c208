//! Channel-backed response stream.
//!
//! A pump task owns the upstream connection and sends caller-format chunks
//! over a bounded channel. The [`DispatchStream`] end holds a drop guard:
//! dropping it cancels the pump, which closes the upstream and releases the
//! credential lease.

use bytes::Bytes;
use futures::Stream;
use gateway_core::{ApiFormat, GatewayError, GatewayResult};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

/// Message sent by the pump task
#[derive(Debug)]
pub enum StreamMessage {
    /// Caller-format bytes
    Chunk(Bytes),
    /// Terminal failure
    Error(GatewayError),
    /// Clean end of stream
    Done,
}

/// A streamed dispatch result
#[derive(Debug)]
pub struct DispatchStream {
    format: ApiFormat,
    provider: String,
    model: String,
    virtual_model: Option<String>,
    pending: VecDeque<Bytes>,
    rx: mpsc::Receiver<StreamMessage>,
    finished: bool,
    _cancel_on_drop: DropGuard,
}

impl DispatchStream {
    /// Wrap the receiving end of a pump channel
    pub fn new(
        format: ApiFormat,
        provider: impl Into<String>,
        model: impl Into<String>,
        rx: mpsc::Receiver<StreamMessage>,
        guard: DropGuard,
    ) -> Self {
        Self {
            format,
            provider: provider.into(),
            model: model.into(),
            virtual_model: None,
            pending: VecDeque::new(),
            rx,
            finished: false,
            _cancel_on_drop: guard,
        }
    }

    /// Caller format of the chunks
    #[must_use]
    pub fn format(&self) -> ApiFormat {
        self.format
    }

    /// Provider serving the stream
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Concrete model serving the stream
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Virtual model the request named, if any
    #[must_use]
    pub fn virtual_model(&self) -> Option<&str> {
        self.virtual_model.as_deref()
    }

    pub(crate) fn set_virtual_model(&mut self, name: Option<String>) {
        self.virtual_model = name;
    }

    /// Put already-received chunks back in front of the stream
    pub(crate) fn prepend(&mut self, chunks: Vec<Bytes>) {
        for chunk in chunks.into_iter().rev() {
            self.pending.push_front(chunk);
        }
    }

    /// Whether the terminal message has been received
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished && self.pending.is_empty()
    }
}

impl Stream for DispatchStream {
    type Item = GatewayResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(chunk) = this.pending.pop_front() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamMessage::Chunk(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(StreamMessage::Error(error))) => {
                this.finished = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(Some(StreamMessage::Done)) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(Err(GatewayError::internal(
                    "upstream stream closed unexpectedly",
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    fn stream(capacity: usize) -> (mpsc::Sender<StreamMessage>, DispatchStream, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let token = CancellationToken::new();
        let s = DispatchStream::new(ApiFormat::OpenAI, "p", "m", rx, token.clone().drop_guard());
        (tx, s, token)
    }

    #[tokio::test]
    async fn test_chunks_then_done() {
        let (tx, mut s, _) = stream(4);
        tx.send(StreamMessage::Chunk(Bytes::from_static(b"b"))).await.unwrap();
        tx.send(StreamMessage::Done).await.unwrap();
        s.prepend(vec![Bytes::from_static(b"a")]);

        assert_eq!(s.next().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(s.next().await.unwrap().unwrap(), Bytes::from_static(b"b"));
        assert!(s.next().await.is_none());
        assert!(s.is_finished());
    }

    #[tokio::test]
    async fn test_error_terminates() {
        let (tx, mut s, _) = stream(4);
        tx.send(StreamMessage::Error(GatewayError::status("p", 500, "boom"))).await.unwrap();
        assert!(s.next().await.unwrap().is_err());
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn test_sender_dropped_without_done_is_an_error() {
        let (tx, mut s, _) = stream(1);
        drop(tx);
        assert!(s.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_drop_cancels_pump() {
        let (_tx, s, token) = stream(1);
        assert!(!token.is_cancelled());
        drop(s);
        assert!(token.is_cancelled());
    }
}
