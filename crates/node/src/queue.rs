//! Bounded FIFO of outbound telemetry, filled by sensors during dispatch and
//! drained by the transport flush.
//!
//! The queue lives in ordinary memory: anything still in it when the node
//! sleeps is gone.

use serde::Serialize;
use std::collections::VecDeque;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct MessageQueue {
    messages: VecDeque<OutboundMessage>,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Serialise `payload` as JSON and append it.  Returns `false` when the
    /// queue is saturated; the caller decides what to do with the reading.
    pub fn enqueue<T: Serialize>(&mut self, topic: &str, payload: &T) -> bool {
        if self.is_full() {
            warn!(topic, capacity = self.capacity, "outbound queue full");
            return false;
        }
        match serde_json::to_vec(payload) {
            Ok(payload) => {
                self.messages.push_back(OutboundMessage {
                    topic: topic.to_string(),
                    payload,
                });
                true
            }
            Err(e) => {
                error!(topic, "failed to serialise payload: {e}");
                false
            }
        }
    }

    pub fn dequeue(&mut self) -> Option<OutboundMessage> {
        self.messages.pop_front()
    }

    /// Discard everything still queued, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.messages.len();
        self.messages.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.capacity
    }
}

// ===========================================================================
// Tests
// ===========================================================================
