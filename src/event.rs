use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::buffers::shared_buffer::SharedSlice;
use crate::end_point::EndPointAddr;
use crate::error::BusError;

/// An application-supplied acknowledgement token: submitted with a send, returned in a
///  `Receipt` event exactly once when the peer has confirmed delivery of that message.
pub type Receipt = u64;

/// Zero-copy view of an inbound message. The bytes live in pooled read buffers; dropping the
///  payload is what releases them (and un-throttles the read path), so consumers should not
///  hold on to payloads longer than necessary.
pub struct MessagePayload {
    segments: Vec<SharedSlice>,
    backlog: Option<ReadBacklog>,
}

impl MessagePayload {
    pub fn new(segments: Vec<SharedSlice>) -> MessagePayload {
        MessagePayload {
            segments,
            backlog: None,
        }
    }

    pub(crate) fn with_backlog(segments: Vec<SharedSlice>, backlog: ReadBacklog) -> MessagePayload {
        backlog.bytes.fetch_add(Self::total_len(&segments) as i64, Ordering::Relaxed);
        MessagePayload {
            segments,
            backlog: Some(backlog),
        }
    }

    fn total_len(segments: &[SharedSlice]) -> usize {
        segments.iter().map(|s| s.len()).sum()
    }

    pub fn len(&self) -> usize {
        Self::total_len(&self.segments)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// the message's segments - one per pooled buffer the message spans, usually exactly one
    pub fn segments(&self) -> &[SharedSlice] {
        &self.segments
    }

    /// copy the message into a contiguous allocation
    pub fn to_vec(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.len());
        for segment in &self.segments {
            result.extend_from_slice(segment.as_ref());
        }
        result
    }
}

impl Drop for MessagePayload {
    fn drop(&mut self) {
        if let Some(backlog) = &self.backlog {
            backlog.bytes.fetch_sub(self.len() as i64, Ordering::Relaxed);
            backlog.drained.notify_one();
        }
    }
}

impl Debug for MessagePayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessagePayload(len={}, segments={})", self.len(), self.segments.len())
    }
}

/// Shared accounting of inbound event bytes not yet dropped by the consumer; the read path
///  throttles itself against this so a slow application backs pressure up to the peer.
#[derive(Clone)]
pub(crate) struct ReadBacklog {
    pub bytes: Arc<AtomicI64>,
    pub drained: Arc<tokio::sync::Notify>,
}

impl ReadBacklog {
    pub fn new() -> ReadBacklog {
        ReadBacklog {
            bytes: Arc::new(AtomicI64::new(0)),
            drained: Arc::new(tokio::sync::Notify::new()),
        }
    }
}

#[derive(Debug)]
pub enum BusEvent {
    /// the bus is open and accepting connections
    Open { local: EndPointAddr },
    /// a logical connection to the peer came into existence
    Connect { peer: EndPointAddr },
    /// the logical connection failed or was closed; no further messages or receipts will be
    ///  emitted for it
    Disconnect { peer: EndPointAddr, cause: Option<BusError> },
    /// the connection's resources are fully reclaimed; terminal event for the peer
    Release { peer: EndPointAddr },
    /// an inbound application message
    Message { peer: EndPointAddr, payload: MessagePayload },
    /// the peer acknowledged delivery of the message the receipt was submitted with
    Receipt { peer: EndPointAddr, receipt: Receipt },
    /// the connection's outbound backlog crossed the excessive threshold
    BacklogExcessive { peer: EndPointAddr },
    /// the connection's outbound backlog receded below half the excessive threshold
    BacklogNormal { peer: EndPointAddr },
    /// the bus is fully closed; terminal event
    Close { local: EndPointAddr },
}

/// Sink side of the bus event channel. Emission never blocks; events to a consumer that went
///  away are silently dropped (their payloads release buffers on drop either way).
#[derive(Clone)]
pub struct EventSink {
    sender: UnboundedSender<BusEvent>,
}

impl EventSink {
    pub fn emit(&self, event: BusEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

pub fn event_channel() -> (EventSink, UnboundedReceiver<BusEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventSink { sender }, receiver)
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use crate::buffers::buffer_pool::BufferPool;
    use crate::buffers::shared_buffer::SharedBuffer;
    use super::*;

    fn slice_of(pool: &Arc<BufferPool>, content: &[u8]) -> SharedSlice {
        let mut buf = pool.acquire();
        buf.put_slice(content);
        let shared = SharedBuffer::new(buf, pool.clone());
        shared.slice(0..content.len())
    }

    #[test]
    fn test_payload_to_vec_concatenates_segments() {
        let pool = Arc::new(BufferPool::new(16, 4));
        let payload = MessagePayload::new(vec![
            slice_of(&pool, b"hel"),
            slice_of(&pool, b"lo"),
        ]);

        assert_eq!(payload.len(), 5);
        assert_eq!(payload.to_vec(), b"hello");
    }

    #[test]
    fn test_payload_drop_decrements_backlog() {
        let pool = Arc::new(BufferPool::new(16, 4));
        let backlog = ReadBacklog::new();

        let payload = MessagePayload::with_backlog(vec![slice_of(&pool, b"hello")], backlog.clone());
        assert_eq!(backlog.bytes.load(Ordering::Relaxed), 5);

        drop(payload);
        assert_eq!(backlog.bytes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_event_channel_delivers() {
        let (sink, mut receiver) = event_channel();
        let peer = EndPointAddr::new("p", std::net::SocketAddr::from(([127, 0, 0, 1], 1)));

        sink.emit(BusEvent::Connect { peer: peer.clone() });

        match receiver.try_recv().unwrap() {
            BusEvent::Connect { peer: p } => assert_eq!(p, peer),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
