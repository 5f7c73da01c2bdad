//! Received frame queue.
//!
//! Many reader threads push, one consumer drains. Frames are tagged with
//! their source endpoint and a monotonically increasing arrival sequence
//! assigned under the queue lock, so pop order is push order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lock;

/// One inbound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    endpoint: u8,
    sequence: u64,
    data: Vec<u8>,
}

impl Frame {
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Arrival order across all endpoints.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// What to do when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest frame to make room.
    #[default]
    DropOldest,
    /// Discard the incoming frame.
    DropNewest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::DropOldest => write!(f, "drop oldest"),
            OverflowPolicy::DropNewest => write!(f, "drop newest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest frame.
    EvictedOldest,
    /// Not queued.
    Rejected,
}

impl PushOutcome {
    pub fn dropped(&self) -> bool {
        !matches!(self, PushOutcome::Queued)
    }
}

#[derive(Default)]
struct Inner {
    frames: VecDeque<Frame>,
    next_sequence: u64,
    dropped: u64,
}

pub struct ReceivedQueue {
    inner: Mutex<Inner>,
    available: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

impl ReceivedQueue {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: Condvar::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Append a frame received on `endpoint`.
    pub fn push(&self, endpoint: u8, data: Vec<u8>) -> PushOutcome {
        let mut inner = lock(&self.inner);
        let mut outcome = PushOutcome::Queued;
        if inner.frames.len() >= self.capacity {
            inner.dropped += 1;
            match self.policy {
                OverflowPolicy::DropOldest => {
                    inner.frames.pop_front();
                    outcome = PushOutcome::EvictedOldest;
                }
                OverflowPolicy::DropNewest => return PushOutcome::Rejected,
            }
        }
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.frames.push_back(Frame {
            endpoint,
            sequence,
            data,
        });
        self.available.notify_one();
        outcome
    }

    /// Oldest frame not yet popped.
    pub fn pop(&self) -> Option<Frame> {
        lock(&self.inner).frames.pop_front()
    }

    /// Like [`pop`](Self::pop), waiting up to `timeout` for a frame.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        let guard = lock(&self.inner);
        let (mut guard, _) = self
            .available
            .wait_timeout_while(guard, timeout, |inner| inner.frames.is_empty())
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.frames.pop_front()
    }

    /// Take every queued frame, oldest first.
    pub fn drain(&self) -> Vec<Frame> {
        lock(&self.inner).frames.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).frames.is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).frames.len()
    }

    /// Frames lost to overflow since creation.
    pub fn dropped(&self) -> u64 {
        lock(&self.inner).dropped
    }
}

impl fmt::Debug for ReceivedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish()
    }
}
