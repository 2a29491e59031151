//! 有界队列：FIFO 或按优先级出队，满时拒绝而不阻塞。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Ranked<M> {
    priority: u8,
    seq: u64,
    message: M,
}

impl<M> PartialEq for Ranked<M> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<M> Eq for Ranked<M> {}

impl<M> PartialOrd for Ranked<M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M> Ord for Ranked<M> {
    // 大顶堆：优先级高者在前，同优先级序号小者在前
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum Buffer<M> {
    Fifo(VecDeque<M>),
    Priority { heap: BinaryHeap<Ranked<M>>, seq: u64 },
}

impl<M> Buffer<M> {
    fn len(&self) -> usize {
        match self {
            Buffer::Fifo(items) => items.len(),
            Buffer::Priority { heap, .. } => heap.len(),
        }
    }

    fn push(&mut self, message: M, priority: u8) {
        match self {
            Buffer::Fifo(items) => items.push_back(message),
            Buffer::Priority { heap, seq } => {
                *seq = seq.wrapping_add(1);
                heap.push(Ranked {
                    priority,
                    seq: *seq,
                    message,
                });
            }
        }
    }

    fn pop(&mut self) -> Option<M> {
        match self {
            Buffer::Fifo(items) => items.pop_front(),
            Buffer::Priority { heap, .. } => heap.pop().map(|ranked| ranked.message),
        }
    }

    fn clear(&mut self) {
        match self {
            Buffer::Fifo(items) => items.clear(),
            Buffer::Priority { heap, .. } => heap.clear(),
        }
    }
}

/// 有界消息队列。
pub struct BoundedQueue<M> {
    name: &'static str,
    capacity: usize,
    buffer: Mutex<Buffer<M>>,
    notify: Notify,
}

impl<M> BoundedQueue<M> {
    pub fn fifo(name: &'static str, capacity: usize) -> Self {
        Self::with_buffer(name, capacity, Buffer::Fifo(VecDeque::new()))
    }

    pub fn priority(name: &'static str, capacity: usize) -> Self {
        Self::with_buffer(
            name,
            capacity,
            Buffer::Priority {
                heap: BinaryHeap::new(),
                seq: 0,
            },
        )
    }

    fn with_buffer(name: &'static str, capacity: usize, buffer: Buffer<M>) -> Self {
        Self {
            name,
            capacity,
            buffer: Mutex::new(buffer),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 入队；队列已满返回 false。FIFO 队列忽略 priority。
    pub fn offer(&self, message: M, priority: u8) -> bool {
        {
            let mut buffer = match self.buffer.lock() {
                Ok(buffer) => buffer,
                Err(_) => return false,
            };
            if buffer.len() >= self.capacity {
                return false;
            }
            buffer.push(message, priority);
        }
        self.notify.notify_one();
        true
    }

    pub fn try_poll(&self) -> Option<M> {
        self.buffer.lock().ok().and_then(|mut buffer| buffer.pop())
    }

    /// 等待至多 `timeout` 取出一条消息。
    pub async fn poll(&self, timeout: Duration) -> Option<M> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_poll() {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_poll();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().map(|buffer| buffer.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_rejects_when_full() {
        let queue = BoundedQueue::fifo("test", 2);
        assert!(queue.offer(1, 0));
        assert!(queue.offer(2, 0));
        assert!(!queue.offer(3, 0));
        assert_eq!(queue.try_poll(), Some(1));
        assert_eq!(queue.try_poll(), Some(2));
        assert_eq!(queue.try_poll(), None);
    }

    #[test]
    fn priority_orders_by_rank_then_arrival() {
        let queue = BoundedQueue::priority("alarm", 10);
        queue.offer("low", 1);
        queue.offer("high-a", 8);
        queue.offer("mid", 5);
        queue.offer("high-b", 8);
        let order: Vec<_> = std::iter::from_fn(|| queue.try_poll()).collect();
        assert_eq!(order, vec!["high-a", "high-b", "mid", "low"]);
    }

    #[tokio::test]
    async fn poll_times_out_on_empty_queue() {
        let queue: BoundedQueue<u32> = BoundedQueue::fifo("empty", 1);
        let started = Instant::now();
        assert!(queue.poll(Duration::from_millis(20)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
