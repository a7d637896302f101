//! # Relay Buffer
//!
//! Shared pending-delivery queue plus the constrained-mode hold queue.
//!
//! Both queues sit behind a single mutex so every append, move and removal is
//! atomic with respect to the others: the ingestion sessions append while the
//! forwarder snapshots, moves or commits, and no interleaving can reorder,
//! duplicate or lose an entry inside the buffer.
//!
//! Delivery works in two steps. The forwarder takes a `snapshot` of a queue,
//! sends it, then `commit`s the number of readings that were delivered. Only
//! that prefix is removed, so readings appended while a batch was in flight
//! stay queued for the next attempt.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::relay::reading::Reading;

/// Which of the two queues an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    /// Readings waiting for the next forward attempt.
    Pending,
    /// Readings set aside while the relay was constrained.
    Held,
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Queue::Pending => f.write_str("pending"),
            Queue::Held => f.write_str("held"),
        }
    }
}

/// Queue lengths at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferCounts {
    pub pending: usize,
    pub held: usize,
}

#[derive(Debug, Default)]
struct Queues {
    pending: VecDeque<Reading>,
    held: VecDeque<Reading>,
}

impl Queues {
    fn get(&self, queue: Queue) -> &VecDeque<Reading> {
        match queue {
            Queue::Pending => &self.pending,
            Queue::Held => &self.held,
        }
    }

    fn get_mut(&mut self, queue: Queue) -> &mut VecDeque<Reading> {
        match queue {
            Queue::Pending => &mut self.pending,
            Queue::Held => &mut self.held,
        }
    }
}

#[derive(Debug, Default)]
pub struct RelayBuffer {
    queues: Mutex<Queues>,
}

impl RelayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a classified reading to `pending`.
    pub fn push_pending(&self, reading: Reading) {
        self.lock().pending.push_back(reading);
    }

    /// Moves everything in `pending` to the end of `held`, keeping order.
    /// Returns how many readings moved.
    pub fn hold_pending(&self) -> usize {
        let mut queues = self.lock();
        let moved = queues.pending.len();
        let pending = std::mem::take(&mut queues.pending);
        queues.held.extend(pending);
        moved
    }

    /// Copies the current contents of `queue`, oldest first.
    pub fn snapshot(&self, queue: Queue) -> Vec<Reading> {
        self.lock().get(queue).iter().cloned().collect()
    }

    /// Removes the first `delivered` readings of `queue` after they were
    /// acknowledged downstream. Returns how many were removed.
    pub fn commit(&self, queue: Queue, delivered: usize) -> usize {
        let mut queues = self.lock();
        let entries = queues.get_mut(queue);
        let removed = delivered.min(entries.len());
        entries.drain(..removed);
        removed
    }

    pub fn len(&self, queue: Queue) -> usize {
        self.lock().get(queue).len()
    }

    pub fn is_empty(&self, queue: Queue) -> bool {
        self.len(queue) == 0
    }

    pub fn counts(&self) -> BufferCounts {
        let queues = self.lock();
        BufferCounts {
            pending: queues.pending.len(),
            held: queues.held.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn reading(n: usize) -> Reading {
        Reading::new(format!("s{n}"), 20.0, 50.0, "2024-05-01T12:00:00Z")
    }

    fn ids(readings: &[Reading]) -> Vec<String> {
        readings.iter().map(|r| r.sensor_id.clone()).collect()
    }

    #[test]
    fn hold_pending_appends_in_order_and_empties_pending() {
        let buffer = RelayBuffer::new();
        buffer.push_pending(reading(1));
        buffer.push_pending(reading(2));
        assert_eq!(buffer.hold_pending(), 2);

        buffer.push_pending(reading(3));
        assert_eq!(buffer.hold_pending(), 1);

        assert!(buffer.is_empty(Queue::Pending));
        assert_eq!(ids(&buffer.snapshot(Queue::Held)), ["s1", "s2", "s3"]);
    }

    #[test]
    fn commit_removes_only_the_delivered_prefix() {
        let buffer = RelayBuffer::new();
        buffer.push_pending(reading(1));
        buffer.push_pending(reading(2));
        let batch = buffer.snapshot(Queue::Pending);

        // arrives while the batch is on the wire
        buffer.push_pending(reading(3));

        assert_eq!(buffer.commit(Queue::Pending, batch.len()), 2);
        assert_eq!(ids(&buffer.snapshot(Queue::Pending)), ["s3"]);
    }

    #[test]
    fn commit_is_bounded_by_queue_length() {
        let buffer = RelayBuffer::new();
        buffer.push_pending(reading(1));
        assert_eq!(buffer.commit(Queue::Pending, 10), 1);
        assert_eq!(buffer.commit(Queue::Held, 10), 0);
    }

    #[test]
    fn a_reading_lives_in_one_queue_only() {
        let buffer = RelayBuffer::new();
        buffer.push_pending(reading(1));
        buffer.hold_pending();
        assert_eq!(
            buffer.counts(),
            BufferCounts {
                pending: 0,
                held: 1
            }
        );
    }

    #[test]
    fn concurrent_appends_are_not_lost() {
        let buffer = Arc::new(RelayBuffer::new());
        let writers: Vec<_> = (0..8)
            .map(|w| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        buffer.push_pending(reading(w * 1000 + i));
                        if i % 50 == 0 {
                            buffer.hold_pending();
                        }
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        let counts = buffer.counts();
        assert_eq!(counts.pending + counts.held, 2000);
    }
}
