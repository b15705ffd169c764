//! Per-request message queues
//!
//! Each in-flight request owns exactly one queue. The channel reader is
//! the sole producer; the request handler is the sole consumer. A queue
//! closing without a terminal message means the session channel died
//! under the request.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

/// One demultiplexed message for a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A piece of response output.
    Chunk { data: String },
    /// The backend reported a failure for this request.
    Error { status: u16, message: String },
    /// The backend reported its own internal timeout.
    Timeout,
    /// Terminal: the response is complete.
    StreamEnd,
    /// Terminal: the channel closed while the request was in flight.
    ChannelClosed,
}

#[derive(Debug, Error)]
#[error("no message within {:?}", .waited)]
pub struct DequeueTimeout {
    pub waited: Duration,
}

/// Consumer half of a request's queue.
pub struct MessageQueue {
    request_id: String,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MessageQueue {
    pub(crate) fn new(request_id: String, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { request_id, rx }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait up to `timeout` for the next message. A closed queue is
    /// reported as `ChannelClosed` so callers see one terminal shape.
    pub async fn dequeue(&mut self, timeout: Duration) -> Result<Message, DequeueTimeout> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Ok(Message::ChannelClosed),
            Err(_) => Err(DequeueTimeout { waited: timeout }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (mpsc::UnboundedSender<Message>, MessageQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, MessageQueue::new("req_test".into(), rx))
    }

    #[tokio::test]
    async fn delivers_messages_in_order() {
        let (tx, mut q) = queue();
        tx.send(Message::Chunk { data: "a".into() }).unwrap();
        tx.send(Message::Chunk { data: "b".into() }).unwrap();
        tx.send(Message::StreamEnd).unwrap();

        assert_eq!(
            q.dequeue(Duration::from_secs(1)).await.unwrap(),
            Message::Chunk { data: "a".into() }
        );
        assert_eq!(
            q.dequeue(Duration::from_secs(1)).await.unwrap(),
            Message::Chunk { data: "b".into() }
        );
        assert_eq!(
            q.dequeue(Duration::from_secs(1)).await.unwrap(),
            Message::StreamEnd
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_times_out_when_empty() {
        let (_tx, mut q) = queue();
        let err = q.dequeue(Duration::from_secs(30)).await.unwrap_err();
        assert_eq!(err.waited, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn dropped_sender_reads_as_channel_closed() {
        let (tx, mut q) = queue();
        drop(tx);
        assert_eq!(
            q.dequeue(Duration::from_secs(1)).await.unwrap(),
            Message::ChannelClosed
        );
    }

    #[tokio::test]
    async fn buffered_messages_survive_sender_drop() {
        let (tx, mut q) = queue();
        tx.send(Message::Chunk { data: "last".into() }).unwrap();
        drop(tx);
        assert_eq!(
            q.dequeue(Duration::from_secs(1)).await.unwrap(),
            Message::Chunk { data: "last".into() }
        );
        assert_eq!(
            q.dequeue(Duration::from_secs(1)).await.unwrap(),
            Message::ChannelClosed
        );
    }
}
