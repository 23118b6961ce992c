//! FIFO intake queue of job ids waiting for a free slot.
//!
//! An optional backlog bound is enforced with a semaphore: a submission
//! takes a [`QueueSlot`] before doing any work, and the permit it holds is
//! handed back when the job leaves the queue (dispatched or cancelled) or
//! when the slot is dropped unused.

use std::collections::VecDeque;
use std::sync::Arc;

use murmur_core::types::JobId;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};

/// The backlog bound has been reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Intake queue is full ({limit} jobs waiting)")]
pub struct QueueFull {
    pub limit: usize,
}

/// A reserved place in the queue. Dropping it unused releases the place.
#[derive(Debug)]
#[must_use = "a slot is released as soon as it is dropped"]
pub struct QueueSlot {
    permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug, Default)]
pub struct IntakeQueue {
    items: Mutex<VecDeque<JobId>>,
    notify: Notify,
    /// Free backlog places; `None` when unbounded.
    backlog: Option<Arc<Semaphore>>,
    limit: Option<usize>,
}

impl IntakeQueue {
    /// Unbounded queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue holding at most `limit` waiting jobs (`None` is unbounded).
    pub fn bounded(limit: Option<usize>) -> Self {
        Self {
            backlog: limit.map(|n| Arc::new(Semaphore::new(n))),
            limit,
            ..Self::default()
        }
    }

    /// Reserve a place without waiting.
    pub fn reserve(&self) -> Result<QueueSlot, QueueFull> {
        let (Some(backlog), Some(limit)) = (&self.backlog, self.limit) else {
            return Ok(QueueSlot { permit: None });
        };
        Arc::clone(backlog)
            .try_acquire_owned()
            .map(|permit| QueueSlot {
                permit: Some(permit),
            })
            .map_err(|_| QueueFull { limit })
    }

    /// Enqueue `id` into a previously reserved place.
    pub async fn push(&self, slot: QueueSlot, id: JobId) {
        // The place stays taken until the job leaves the queue.
        if let Some(permit) = slot.permit {
            permit.forget();
        }
        self.items.lock().await.push_back(id);
        self.notify.notify_one();
    }

    /// Take a queued job out of line. Returns `false` if it was not queued
    /// (already dispatched or never pushed).
    pub async fn remove(&self, id: JobId) -> bool {
        let mut items = self.items.lock().await;
        match items.iter().position(|queued| *queued == id) {
            Some(index) => {
                items.remove(index);
                self.release();
                true
            }
            None => false,
        }
    }

    /// Wait for and return the oldest queued job.
    pub async fn pop(&self) -> JobId {
        loop {
            // Register interest before checking, so a push between the
            // check and the await is not missed.
            let notified = self.notify.notified();
            if let Some(id) = self.items.lock().await.pop_front() {
                self.release();
                return id;
            }
            notified.await;
        }
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    fn release(&self) {
        if let Some(backlog) = &self.backlog {
            backlog.add_permits(1);
        }
    }
}
