//! Unbounded multi-producer multi-consumer task queue.
//!
//! Producers push through a cloned sender and never block. Workers share
//! the single receiver behind an async mutex; whoever holds the lock takes
//! the next task, so every task is delivered to exactly one worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

/// A unit of work plus where its result goes.
#[derive(Debug)]
pub struct Task<P, O> {
    pub payload: P,
    pub destination: mpsc::UnboundedSender<O>,
}

/// Outcome of one [`QueueReceiver::poll`].
#[derive(Debug)]
pub enum Polled<T> {
    Task(T),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The queue was closed and drained.
    Closed,
}

/// FIFO queue shared by a pool's producers and workers.
pub struct TaskQueue<T> {
    sender: mpsc::UnboundedSender<T>,
    receiver: QueueReceiver<T>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: QueueReceiver {
                inner: Arc::new(Mutex::new(receiver)),
            },
        }
    }

    /// Enqueue a task. Hands the task back if the queue has been closed.
    pub fn submit(&self, task: T) -> Result<(), T> {
        self.sender.send(task).map_err(|e| e.0)
    }

    /// A consumer handle for one worker.
    pub fn receiver(&self) -> QueueReceiver<T> {
        self.receiver.clone()
    }

    /// Refuse further submissions and drop everything still queued.
    ///
    /// Returns the number of discarded tasks.
    pub async fn close(&self) -> usize {
        let mut rx = self.receiver.inner.lock().await;
        rx.close();
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of a [`TaskQueue`].
pub struct QueueReceiver<T> {
    inner: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Wait up to `timeout` for the next task.
    ///
    /// The timeout covers waiting for the lock as well as the receive.
    /// Dropping the returned future never loses a task.
    pub async fn poll(&self, timeout: Duration) -> Polled<T> {
        let next = async { self.inner.lock().await.recv().await };
        match tokio::time::timeout(timeout, next).await {
            Ok(Some(task)) => Polled::Task(task),
            Ok(None) => Polled::Closed,
            Err(_elapsed) => Polled::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use assert_matches::assert_matches;

    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn fifo_for_single_consumer() {
        let queue = TaskQueue::new();
        for i in 0..5 {
            queue.submit(i).expect("open queue");
        }
        let rx = queue.receiver();
        for i in 0..5 {
            assert_matches!(rx.poll(SHORT).await, Polled::Task(n) if n == i);
        }
        assert_matches!(rx.poll(SHORT).await, Polled::Timeout);
    }

    #[tokio::test]
    async fn each_task_reaches_one_consumer() {
        let queue = TaskQueue::new();
        for i in 0..100 {
            queue.submit(i).expect("open queue");
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let rx = queue.receiver();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Polled::Task(n) = rx.poll(SHORT).await {
                        seen.push(n);
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for consumer in consumers {
            let seen = consumer.await.expect("consumer");
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
            all.extend(seen);
        }
        assert_eq!(all.len(), 100);
        assert_eq!(all.into_iter().collect::<HashSet<_>>().len(), 100);
    }

    #[tokio::test]
    async fn close_discards_and_rejects() {
        let queue = TaskQueue::new();
        queue.submit(1).expect("open queue");
        queue.submit(2).expect("open queue");

        assert_eq!(queue.close().await, 2);
        assert_eq!(queue.submit(3), Err(3));
        assert_matches!(queue.receiver().poll(SHORT).await, Polled::Closed);
    }

    #[tokio::test]
    async fn dropped_destination_is_detectable() {
        let (tx, rx) = mpsc::unbounded_channel::<u32>();
        let task = Task {
            payload: (),
            destination: tx,
        };
        drop(rx);
        assert!(task.destination.send(1).is_err());
    }
}
