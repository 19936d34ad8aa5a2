//! Bounded pending queue and single-flight processing state

use std::collections::VecDeque;
use tokio::sync::oneshot;

use crate::context::{ColorContext, ColorResult};

/// FIFO with a hard length limit; pushing at the limit evicts the oldest item
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns the evicted head when the queue was full
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
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

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }
}

/// A queued context plus the channel its submitter is waiting on
#[derive(Debug)]
pub struct PendingWork {
    pub context: ColorContext,
    pub responder: Option<oneshot::Sender<ColorResult>>,
}

impl PendingWork {
    pub fn new(context: ColorContext) -> (Self, oneshot::Receiver<ColorResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                context,
                responder: Some(tx),
            },
            rx,
        )
    }

    /// Deliver the result; a submitter that stopped waiting is not an error
    pub fn respond(mut self, result: ColorResult) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(result);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Processing,
    Disposed,
}

/// Owned by one engine; at most one context is in flight
#[derive(Debug)]
pub struct ProcessingState {
    pub is_processing: bool,
    pub queue: BoundedQueue<PendingWork>,
    pub last_result: Option<ColorResult>,
    /// Incremented per cycle so late completions can be told apart
    pub cycle: u64,
}

impl ProcessingState {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            is_processing: false,
            queue: BoundedQueue::new(max_queue_size),
            last_result: None,
            cycle: 0,
        }
    }
}
