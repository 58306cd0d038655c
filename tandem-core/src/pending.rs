//! Queue of captured-but-unflushed local updates.

use std::collections::VecDeque;

/// Local updates waiting for the next successful flush.
///
/// Updates are only removed by `drain`; a failed flush hands them back with
/// `requeue` so nothing captured locally is ever dropped.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queue: VecDeque<Vec<u8>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a captured update.
    pub fn enqueue(&mut self, update: Vec<u8>) {
        self.queue.push_back(update);
    }

    /// Take every queued update, oldest first.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    /// Put a drained batch back in front of anything captured since.
    pub fn requeue(&mut self, batch: Vec<Vec<u8>>) {
        for update in batch.into_iter().rev() {
            self.queue.push_front(update);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_in_order() {
        let mut queue = PendingQueue::new();
        assert!(queue.is_empty());

        queue.enqueue(vec![1, 2, 3]);
        queue.enqueue(vec![4, 5, 6, 7]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained, vec![vec![1, 2, 3], vec![4, 5, 6, 7]]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_goes_before_newer_updates() {
        let mut queue = PendingQueue::new();
        queue.enqueue(vec![1]);
        queue.enqueue(vec![2]);
        let batch = queue.drain();

        // Captured while the failed flush was in flight
        queue.enqueue(vec![3]);
        queue.requeue(batch);

        assert_eq!(queue.drain(), vec![vec![1], vec![2], vec![3]]);
    }
}
