//! Bounded buffer for frames sent while the tunnel is down.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::traits::{Frame, FrameSink, RequestQueue};

pub struct OutboundQueue {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
    sink: Arc<dyn FrameSink>,
}

impl OutboundQueue {
    pub fn new(capacity: usize, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            sink,
        }
    }

    fn frames(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer a frame. A full queue hands the frame back.
    pub fn push(&self, frame: Frame) -> Result<(), Frame> {
        let mut frames = self.frames();
        if frames.len() >= self.capacity {
            warn!(capacity = self.capacity, "Outbound queue full, rejecting frame");
            return Err(frame);
        }
        frames.push_back(frame);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl RequestQueue for OutboundQueue {
    /// Send buffered frames in order. Stops at the first failed send and keeps
    /// that frame at the head.
    async fn flush(&self) -> usize {
        let mut sent = 0;
        loop {
            let Some(frame) = self.frames().pop_front() else {
                break;
            };
            if let Err(e) = self.sink.send(frame.clone()).await {
                warn!(sent, "Queue flush interrupted: {e}");
                self.frames().push_front(frame);
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            debug!(sent, "Flushed outbound queue");
        }
        sent
    }

    fn size(&self) -> usize {
        self.frames().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use crate::traits::Transport;

    #[tokio::test]
    async fn flush_sends_in_order() {
        let transport = FakeTransport::new();
        transport.connect("t").await.unwrap();
        let queue = OutboundQueue::new(4, transport.clone());
        queue.push(Frame::Text("a".into())).unwrap();
        queue.push(Frame::Text("b".into())).unwrap();
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.flush().await, 2);
        assert_eq!(queue.size(), 0);
        assert_eq!(
            *transport.sent.lock().unwrap(),
            vec![Frame::Text("a".into()), Frame::Text("b".into())]
        );
    }

    #[test]
    fn full_queue_rejects() {
        let queue = OutboundQueue::new(1, FakeTransport::new());
        queue.push(Frame::Binary(vec![1])).unwrap();
        assert_eq!(queue.push(Frame::Binary(vec![2])), Err(Frame::Binary(vec![2])));
    }

    #[tokio::test]
    async fn failed_flush_keeps_frames() {
        let queue = OutboundQueue::new(4, FakeTransport::new());
        queue.push(Frame::Text("a".into())).unwrap();
        assert_eq!(queue.flush().await, 0);
        assert_eq!(queue.size(), 1);
    }
}
