//! Bounded drop-oldest buffer stage between a distribution tap and an
//! encoder.
//!
//! The producer side never blocks: when the queue is full the oldest
//! buffered item is discarded to make room. A slow branch therefore
//! loses frames instead of stalling the distribution stage.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Result of [`LeakyQueue::pop_timeout`].
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    Item(T),
    Timeout,
    /// Closed and drained.
    Closed,
}

/// Counters kept by a [`LeakyQueue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    /// Items discarded to make room for newer ones.
    pub dropped: u64,
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    stats: QueueStats,
}

#[derive(Debug)]
pub struct LeakyQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    not_empty: Condvar,
}

impl<T> LeakyQueue<T> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                stats: QueueStats::default(),
            }),
            not_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue `item`, dropping the oldest entry if full.
    ///
    /// Returns `false` (and discards `item`) once the queue is closed.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if state.items.len() >= self.capacity {
            state.items.pop_front();
            state.stats.dropped += 1;
        }
        state.items.push_back(item);
        state.stats.pushed += 1;
        drop(state);
        self.not_empty.notify_one();
        true
    }

    /// Wait up to `timeout` for an item. Items still buffered when the
    /// queue is closed are not returned.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Pop::Closed;
            }
            if let Some(item) = state.items.pop_front() {
                state.stats.popped += 1;
                return Pop::Item(item);
            }
            if self.not_empty.wait_for(&mut state, timeout).timed_out() {
                if state.closed {
                    return Pop::Closed;
                }
                return match state.items.pop_front() {
                    Some(item) => {
                        state.stats.popped += 1;
                        Pop::Item(item)
                    }
                    None => Pop::Timeout,
                };
            }
        }
    }

    /// Close the queue, discard buffered items and wake any waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.items.clear();
        drop(state);
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }
}
