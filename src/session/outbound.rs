//! Bounded queue for publishes issued while not connected

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// A SEND waiting for a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub destination: String,
    /// Serialized JSON body
    pub payload: Bytes,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboundEnvelope {
    pub fn new(destination: impl Into<String>, payload: Bytes) -> Self {
        Self {
            destination: destination.into(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// FIFO with drop-oldest overflow
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<OutboundEnvelope>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append an envelope. Returns whatever was evicted to make room: the
    /// oldest entry when full, or `envelope` itself when capacity is zero.
    pub fn push(&mut self, envelope: OutboundEnvelope) -> Option<OutboundEnvelope> {
        if self.capacity == 0 {
            return Some(envelope);
        }
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(envelope);
        evicted
    }

    pub fn pop_front(&mut self) -> Option<OutboundEnvelope> {
        self.items.pop_front()
    }

    /// Put back an envelope that could not be sent, keeping its position
    pub fn push_front(&mut self, envelope: OutboundEnvelope) {
        self.items.push_front(envelope);
        if self.items.len() > self.capacity {
            self.items.pop_back();
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(n: u32) -> OutboundEnvelope {
        OutboundEnvelope::new("/topic/t", Bytes::from(n.to_string()))
    }

    fn pop_all(queue: &mut OutboundQueue) -> Vec<Bytes> {
        std::iter::from_fn(|| queue.pop_front()).map(|e| e.payload).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = OutboundQueue::new(4);
        for n in 0..3 {
            assert!(queue.push(envelope(n)).is_none());
        }
        let drained = pop_all(&mut queue);
        assert_eq!(drained, vec!["0", "1", "2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        // Arrange
        let mut queue = OutboundQueue::new(3);

        // Act
        let evicted: Vec<OutboundEnvelope> = (0..5).filter_map(|n| queue.push(envelope(n))).collect();

        // Assert
        let evicted: Vec<Bytes> = evicted.into_iter().map(|e| e.payload).collect();
        assert_eq!(evicted, vec!["0", "1"]);
        let kept = pop_all(&mut queue);
        assert_eq!(kept, vec!["2", "3", "4"]);
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let mut queue = OutboundQueue::new(0);
        let rejected = queue.push(envelope(7)).unwrap();
        assert_eq!(rejected.payload, "7");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_front_restores_position() {
        let mut queue = OutboundQueue::new(3);
        queue.push(envelope(1));
        queue.push(envelope(2));
        let head = queue.pop_front().unwrap();
        queue.push_front(head);
        assert_eq!(queue.pop_front().unwrap().payload, "1");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut queue = OutboundQueue::new(2);
        queue.push(envelope(1));
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 2);
    }
}
