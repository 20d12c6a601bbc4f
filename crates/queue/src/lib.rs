//! Bounded priority queue of pending tasks, ordered by
//! `(priority desc, enqueue-time asc)`, with O(log n) arbitrary removal
//! via an index map alongside the heap.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use ao_domain::model::TaskId;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub priority: i64,
    pub queued_at: u64,
}

/// Min/max comparisons are driven entirely by `(priority, queued_at)`;
/// `task_id` never participates in ordering.
#[derive(Debug, Clone)]
struct Entry {
    task: QueuedTask,
    /// Monotonic insertion sequence, used only to break ties when
    /// `queued_at` itself collides (same millisecond).
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority
            && self.task.queued_at == other.task.queued_at
            && self.seq == other.seq
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
        // BinaryHeap is a max-heap; "precedes" (spec's ordering law) must
        // compare greater, so higher priority and earlier queued_at both
        // sort to the top.
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.task.queued_at.cmp(&self.task.queued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task already exists: {0}")]
    TaskExists(TaskId),
    #[error("queue is full")]
    QueueFull,
}

struct Inner {
    heap: BinaryHeap<Entry>,
    /// task-id -> current sequence number, used to validate heap entries
    /// without an explicit decrease-key (stale entries are dropped lazily
    /// on pop).
    index: HashMap<TaskId, u64>,
    next_seq: u64,
}

/// Thread-safe; every operation takes a single internal lock.
pub struct PriorityQueue {
    max_size: usize,
    inner: Mutex<Inner>,
}

impl PriorityQueue {
    /// `max_size = 0` means unbounded.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                index: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn enqueue(&self, task_id: TaskId, priority: i64, queued_at: u64) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&task_id) {
            return Err(QueueError::TaskExists(task_id));
        }
        if self.max_size > 0 && inner.index.len() >= self.max_size {
            return Err(QueueError::QueueFull);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.index.insert(task_id.clone(), seq);
        inner.heap.push(Entry {
            task: QueuedTask {
                task_id,
                priority,
                queued_at,
            },
            seq,
        });
        Ok(())
    }

    pub fn dequeue(&self) -> Option<QueuedTask> {
        let mut inner = self.inner.lock();
        loop {
            let entry = inner.heap.pop()?;
            match inner.index.get(&entry.task.task_id) {
                Some(&seq) if seq == entry.seq => {
                    inner.index.remove(&entry.task.task_id);
                    return Some(entry.task);
                }
                // Stale entry left behind by `remove`; skip it.
                _ => continue,
            }
        }
    }

    /// O(log n) in the amortized sense: the entry is marked removed by
    /// dropping it from the index; the heap lazily discards it on the
    /// next `dequeue`/`list` that would have returned it.
    pub fn remove(&self, task_id: &TaskId) -> bool {
        self.inner.lock().index.remove(task_id).is_some()
    }

    pub fn list(&self) -> Vec<QueuedTask> {
        let inner = self.inner.lock();
        let mut items: Vec<QueuedTask> = inner
            .heap
            .iter()
            .filter(|e| inner.index.get(&e.task.task_id) == Some(&e.seq))
            .map(|e| e.task.clone())
            .collect();
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.queued_at.cmp(&b.queued_at))
        });
        items
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.max_size > 0 && self.len() >= self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(s: &str) -> TaskId {
        TaskId::from(s)
    }

    #[test]
    fn dequeues_highest_priority_first() {
        let q = PriorityQueue::new(0);
        q.enqueue(tid("low"), 1, 0).unwrap();
        q.enqueue(tid("high"), 10, 1).unwrap();
        q.enqueue(tid("mid"), 5, 2).unwrap();

        assert_eq!(q.dequeue().unwrap().task_id, tid("high"));
        assert_eq!(q.dequeue().unwrap().task_id, tid("mid"));
        assert_eq!(q.dequeue().unwrap().task_id, tid("low"));
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn ties_broken_by_earliest_queued_at() {
        let q = PriorityQueue::new(0);
        q.enqueue(tid("second"), 5, 100).unwrap();
        q.enqueue(tid("first"), 5, 50).unwrap();

        assert_eq!(q.dequeue().unwrap().task_id, tid("first"));
        assert_eq!(q.dequeue().unwrap().task_id, tid("second"));
    }

    #[test]
    fn enqueue_duplicate_task_id_fails() {
        let q = PriorityQueue::new(0);
        q.enqueue(tid("a"), 1, 0).unwrap();
        assert_eq!(q.enqueue(tid("a"), 2, 1), Err(QueueError::TaskExists(tid("a"))));
    }

    #[test]
    fn enqueue_beyond_max_size_fails() {
        let q = PriorityQueue::new(1);
        q.enqueue(tid("a"), 1, 0).unwrap();
        assert_eq!(q.enqueue(tid("b"), 1, 1), Err(QueueError::QueueFull));
        assert!(q.is_full());
    }

    #[test]
    fn unbounded_queue_never_reports_full() {
        let q = PriorityQueue::new(0);
        for i in 0..100 {
            q.enqueue(tid(&format!("t{i}")), 0, i).unwrap();
        }
        assert!(!q.is_full());
    }

    #[test]
    fn remove_drops_a_pending_task() {
        let q = PriorityQueue::new(0);
        q.enqueue(tid("a"), 1, 0).unwrap();
        q.enqueue(tid("b"), 2, 1).unwrap();

        assert!(q.remove(&tid("a")));
        assert!(!q.remove(&tid("a")), "second removal must be a no-op");
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue().unwrap().task_id, tid("b"));
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn removed_task_id_can_be_requeued() {
        let q = PriorityQueue::new(0);
        q.enqueue(tid("a"), 1, 0).unwrap();
        q.remove(&tid("a"));
        q.enqueue(tid("a"), 9, 5).unwrap();
        assert_eq!(q.dequeue().unwrap().priority, 9);
    }

    #[test]
    fn list_reflects_ordering_law_without_mutating_queue() {
        let q = PriorityQueue::new(0);
        q.enqueue(tid("a"), 1, 10).unwrap();
        q.enqueue(tid("b"), 3, 20).unwrap();
        q.enqueue(tid("c"), 3, 5).unwrap();

        let listed: Vec<_> = q.list().into_iter().map(|t| t.task_id).collect();
        assert_eq!(listed, vec![tid("c"), tid("b"), tid("a")]);
        assert_eq!(q.len(), 3, "list must not dequeue");
    }

    #[test]
    fn len_and_is_empty_track_state() {
        let q = PriorityQueue::new(0);
        assert!(q.is_empty());
        q.enqueue(tid("a"), 1, 0).unwrap();
        assert_eq!(q.len(), 1);
        assert!(!q.is_empty());
        q.dequeue();
        assert!(q.is_empty());
    }
}
