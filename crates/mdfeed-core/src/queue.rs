//! Bounded queues: a priority task queue feeding the producer pool, and
//! a FIFO data queue feeding the consumer pool. Both support many
//! concurrent producers and consumers and bounded `put`/`get` with timeout.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::task::{DataBatch, Task};

/// Ordering key for the priority queue: higher [`Priority`](mdfeed_db::models::Priority)
/// drains first; equal priority drains FIFO via a monotonic sequence number.
struct Entry {
    task: Task,
    sequence: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.sequence == other.sequence
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority, then lower (earlier)
        // sequence number, must compare greater.
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// A bounded, priority-ordered queue of [`Task`]s.
///
/// Safe for many concurrent producers and consumers: both `put` and `get`
/// take the inner lock only long enough to mutate the heap, and wait
/// outside the lock on a [`Notify`].
pub struct TaskQueue {
    capacity: usize,
    heap: Mutex<BinaryHeap<Entry>>,
    next_sequence: AtomicU64,
    not_empty: Notify,
    not_full: Notify,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: Mutex::new(BinaryHeap::new()),
            next_sequence: AtomicU64::new(0),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Enqueue `task`, blocking while the queue is full. Returns `false` if
    /// `timeout` elapses before a slot frees up.
    pub async fn put(&self, task: Task, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut heap = self.heap.lock().await;
                if heap.len() < self.capacity {
                    let sequence = self.next_sequence.fetch_add(1, AtomicOrdering::Relaxed);
                    heap.push(Entry { task, sequence });
                    drop(heap);
                    self.not_empty.notify_one();
                    return true;
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::select! {
                _ = self.not_full.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return false,
            }
        }
    }

    /// Dequeue the highest-priority, earliest-submitted task. Returns `None`
    /// if `timeout` elapses with nothing available.
    pub async fn get(&self, timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut heap = self.heap.lock().await;
                if let Some(entry) = heap.pop() {
                    drop(heap);
                    self.not_full.notify_one();
                    return Some(entry.task);
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::select! {
                _ = self.not_empty.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// A bounded FIFO queue of [`DataBatch`]es, linking the producer pool to the
/// consumer pool.
pub struct DataQueue {
    capacity: usize,
    items: Mutex<VecDeque<DataBatch>>,
    not_empty: Notify,
    not_full: Notify,
}

impl DataQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::new()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub async fn put(&self, batch: DataBatch, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut items = self.items.lock().await;
                if items.len() < self.capacity {
                    items.push_back(batch);
                    drop(items);
                    self.not_empty.notify_one();
                    return true;
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::select! {
                _ = self.not_full.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return false,
            }
        }
    }

    pub async fn get(&self, timeout: Duration) -> Option<DataBatch> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(batch) = items.pop_front() {
                    drop(items);
                    self.not_full.notify_one();
                    return Some(batch);
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::select! {
                _ = self.not_empty.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdfeed_db::models::{Priority, RowSet, TaskType};
    use std::sync::Arc;

    fn task(priority: Priority) -> Task {
        Task::new("600519.SH", TaskType::Daily, Default::default(), priority, 3)
    }

    #[tokio::test]
    async fn high_priority_drains_before_normal_and_low() {
        let q = TaskQueue::new(10);
        q.put(task(Priority::Low), Duration::from_secs(1)).await;
        q.put(task(Priority::High), Duration::from_secs(1)).await;
        q.put(task(Priority::Normal), Duration::from_secs(1)).await;

        assert_eq!(q.get(Duration::from_secs(1)).await.unwrap().priority, Priority::High);
        assert_eq!(q.get(Duration::from_secs(1)).await.unwrap().priority, Priority::Normal);
        assert_eq!(q.get(Duration::from_secs(1)).await.unwrap().priority, Priority::Low);
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let q = TaskQueue::new(10);
        let first = task(Priority::Normal);
        let first_id = first.id;
        q.put(first, Duration::from_secs(1)).await;
        q.put(task(Priority::Normal), Duration::from_secs(1)).await;

        assert_eq!(q.get(Duration::from_secs(1)).await.unwrap().id, first_id);
    }

    #[tokio::test]
    async fn get_times_out_when_empty() {
        let q = TaskQueue::new(10);
        let result = q.get(Duration::from_millis(20)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn put_times_out_when_full() {
        let q = TaskQueue::new(1);
        assert!(q.put(task(Priority::Normal), Duration::from_secs(1)).await);
        let timed_out = !q.put(task(Priority::Normal), Duration::from_millis(20)).await;
        assert!(timed_out);
    }

    #[tokio::test]
    async fn put_unblocks_once_a_slot_frees_up() {
        let q = Arc::new(TaskQueue::new(1));
        q.put(task(Priority::Normal), Duration::from_secs(1)).await;

        let q2 = Arc::clone(&q);
        let putter = tokio::spawn(async move { q2.put(task(Priority::High), Duration::from_secs(1)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.get(Duration::from_secs(1)).await.unwrap();

        assert!(putter.await.unwrap());
    }

    #[tokio::test]
    async fn data_queue_is_plain_fifo() {
        let q = DataQueue::new(10);
        let t = task(Priority::Normal);
        let a = DataBatch::new(&t, RowSet::default());
        let b = DataBatch::new(&t, RowSet::default());
        let a_id = a.batch_id;
        q.put(a, Duration::from_secs(1)).await;
        q.put(b, Duration::from_secs(1)).await;

        assert_eq!(q.get(Duration::from_secs(1)).await.unwrap().batch_id, a_id);
    }
}
