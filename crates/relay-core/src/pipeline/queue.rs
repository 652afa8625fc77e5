//! Bounded queues for backpressure between pipeline stages.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};

/// Error returned when the queue's receiving side is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

/// A fixed-capacity multi-producer, multi-consumer FIFO.
///
/// When the buffer is full, `push` waits, so a slow stage stalls the
/// stage in front of it. This is the pipeline's only backpressure
/// mechanism. Consumers share one receiver; whichever worker is waiting
/// first gets the next item, and FIFO order is kept within the queue.
///
/// Every pushed item counts as unfinished until a consumer calls
/// [`task_done`](Self::task_done) for it, which lets [`join`](Self::join)
/// wait for a queue to be drained *and* acknowledged.
pub struct BoundedQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    unfinished: Arc<watch::Sender<usize>>,
    capacity: usize,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            unfinished: self.unfinished.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; the pipeline builder rejects that
    /// before any queue is created.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (unfinished, _) = watch::channel(0usize);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            unfinished: Arc::new(unfinished),
            capacity,
        }
    }

    /// Append an item, waiting while the queue is full.
    pub async fn push(&self, item: T) -> Result<(), QueueClosed> {
        self.unfinished.send_modify(|n| *n += 1);
        if self.tx.send(item).await.is_err() {
            self.task_done();
            return Err(QueueClosed);
        }
        Ok(())
    }

    /// Append an item without waiting. Returns the item if the queue is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.unfinished.send_modify(|n| *n += 1);
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item))
            | Err(mpsc::error::TrySendError::Closed(item)) => {
                self.task_done();
                Err(item)
            }
        }
    }

    /// Remove the oldest item, waiting while the queue is empty.
    ///
    /// Returns `None` only if every sender has been dropped, which cannot
    /// happen while this handle is alive.
    pub async fn pop(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Acknowledge one popped item as fully handled.
    pub fn task_done(&self) {
        self.unfinished.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Wait until every pushed item has been popped and acknowledged.
    pub async fn join(&self) {
        let mut rx = self.unfinished.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Items pushed but not yet acknowledged.
    pub fn unfinished(&self) -> usize {
        *self.unfinished.borrow()
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
