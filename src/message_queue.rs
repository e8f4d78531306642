// SPDX-License-Identifier: GPL-3.0-only

//! FIFO command queue for worker threads
//!
//! Each worker owns one queue and drains it in order. Synchronous commands
//! carry a [`Reply`] sender; the caller blocks on the matching receiver. A
//! reply sender dropped without answering (the message was flushed or the
//! worker exited) surfaces as [`HalError::Flushed`].

use crate::errors::{HalError, HalResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type Reply<T> = oneshot::Sender<HalResult<T>>;

/// Answer a synchronous command; the caller may already have gone away
pub fn reply<T>(tx: Reply<T>, result: HalResult<T>) {
    if tx.send(result).is_err() {
        debug!("Reply dropped, caller no longer waiting");
    }
}

struct QueueInner<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
    closed: AtomicBool,
}

pub struct MessageQueue<T> {
    name: &'static str,
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> MessageQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(QueueInner {
                items: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn send(&self, message: T) -> HalResult<()> {
        let mut items = self.items();
        // Checked under the lock so nothing lands after the final drain
        if self.inner.closed.load(Ordering::Acquire) {
            warn!(queue = self.name, "Send on a closed queue");
            return Err(HalError::InvalidOperation(format!("{} queue closed", self.name)));
        }
        items.push_back(message);
        drop(items);
        self.inner.ready.notify_one();
        Ok(())
    }

    /// Send a command and block until the worker answers it
    pub fn request<R>(&self, build: impl FnOnce(Reply<R>) -> T) -> HalResult<R> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.blocking_recv().unwrap_or(Err(HalError::Flushed))
    }

    /// Block until a message arrives; `None` once closed and drained
    pub fn receive(&self) -> Option<T> {
        let mut items = self.items();
        loop {
            if let Some(message) = items.pop_front() {
                return Some(message);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            items = self
                .inner
                .ready
                .wait(items)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn receive_timeout(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items();
        if items.is_empty() && !self.inner.closed.load(Ordering::Acquire) {
            items = self
                .inner
                .ready
                .wait_timeout(items, timeout)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        items.pop_front()
    }

    pub fn try_receive(&self) -> Option<T> {
        self.items().pop_front()
    }

    /// Remove every queued message matching `pred`, preserving the order of the rest
    pub fn remove_matching(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut items = self.items();
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(items.len());
        for message in items.drain(..) {
            if pred(&message) {
                removed.push(message);
            } else {
                kept.push_back(message);
            }
        }
        *items = kept;
        if !removed.is_empty() {
            debug!(queue = self.name, removed = removed.len(), "Removed queued messages");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Refuse further sends and wake the receiver
    pub fn close(&self) {
        let items = self.items();
        self.inner.closed.store(true, Ordering::Release);
        drop(items);
        self.inner.ready.notify_all();
    }
}
