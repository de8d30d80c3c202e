//! # Buffered Rendezvous Queue
//!
//! The coordination primitive behind every per-invocation context. A queue
//! holds two collections: pending items and pending consumers. A consumer is
//! a predicate plus a completion slot; pushing an item hands it to the first
//! registered consumer that accepts it, otherwise buffers it FIFO.
//!
//! Predicate matching lets several logical streams share one queue without
//! head-of-line blocking: a wait for a confirmation reply with a specific
//! correlation id coexists with a wait for any authorization message, and an
//! item satisfying both goes to the earlier-registered consumer.
//!
//! Shutdown comes in two flavours:
//!
//! - [`AsyncQueue::flush`] drops everything; with an error, pending consumers
//!   complete with that error and later waits fail fast until the next push
//!   reopens the queue.
//! - [`AsyncQueue::close`] completes pending consumers with "empty" but keeps
//!   buffered items deliverable, so a consumer can drain what already arrived
//!   and then observe the end of the stream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

/// Failure modes delivered to queue users.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The buffer reached its capacity bound; the item was not accepted.
    #[error("queue buffer is full")]
    Full,

    /// The queue was flushed while the consumer was waiting.
    #[error("queue was closed")]
    Closed,

    /// The owning context was cancelled while the consumer was waiting.
    #[error("wait was cancelled")]
    Cancelled,
}

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send>;
type Completion<T> = oneshot::Sender<Result<Option<T>, QueueError>>;

struct Consumer<T> {
    id: u64,
    predicate: Predicate<T>,
    completion: Completion<T>,
}

#[derive(Clone, PartialEq)]
enum Shutdown {
    Open,
    /// Buffered items still drain; waits on an empty buffer complete empty.
    Closed,
    /// Waits fail immediately with the stored error.
    Errored(QueueError),
}

struct Inner<T> {
    items: VecDeque<T>,
    consumers: VecDeque<Consumer<T>>,
    shutdown: Shutdown,
    next_consumer_id: u64,
}

impl<T> Inner<T> {
    /// Offer an item to registered consumers in registration order.
    /// Returns the item back when nobody accepts it.
    fn hand_to_consumer(&mut self, item: T) -> Option<T> {
        let mut item = item;
        loop {
            let pos = self.consumers.iter().position(|c| (c.predicate)(&item));
            let Some(consumer) = pos.and_then(|p| self.consumers.remove(p)) else {
                return Some(item);
            };
            match consumer.completion.send(Ok(Some(item))) {
                Ok(()) => return None,
                // Receiver already gone (timed out); reclaim the item and
                // keep offering it to later consumers.
                Err(Ok(Some(reclaimed))) => item = reclaimed,
                Err(_) => return None,
            }
        }
    }
}

/// Single-producer/single-consumer rendezvous with buffering and
/// predicate-filtered waiting.
pub struct AsyncQueue<T> {
    inner: Arc<Mutex<Inner<T>>>,
    capacity: Option<usize>,
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Send + 'static> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> AsyncQueue<T> {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Create a queue whose item buffer holds at most `capacity` entries.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                items: VecDeque::new(),
                consumers: VecDeque::new(),
                shutdown: Shutdown::Open,
                next_consumer_id: 0,
            })),
            capacity,
        }
    }

    /// Create a queue pre-seeded with buffered items (restore path).
    pub fn seeded(items: Vec<T>, capacity: Option<usize>) -> Self {
        let queue = Self::with_capacity(capacity);
        queue.inner.lock().items = items.into();
        queue
    }

    /// Offer an item: hand it to the first accepting consumer, else buffer.
    ///
    /// A push after a flush or close reopens the queue.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.shutdown != Shutdown::Open {
            inner.shutdown = Shutdown::Open;
        }
        let Some(item) = inner.hand_to_consumer(item) else {
            return Ok(());
        };
        if let Some(capacity) = self.capacity {
            if inner.items.len() >= capacity {
                return Err(QueueError::Full);
            }
        }
        inner.items.push_back(item);
        Ok(())
    }

    /// Offer a batch atomically: every item is admitted, or none is.
    ///
    /// Capacity is checked pessimistically against the whole batch before
    /// any handoff, so a `Full` rejection leaves the queue untouched.
    pub fn push_all(&self, batch: Vec<T>) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if let Some(capacity) = self.capacity {
            if inner.items.len() + batch.len() > capacity {
                return Err(QueueError::Full);
            }
        }
        if inner.shutdown != Shutdown::Open {
            inner.shutdown = Shutdown::Open;
        }
        for item in batch {
            if let Some(item) = inner.hand_to_consumer(item) {
                inner.items.push_back(item);
            }
        }
        Ok(())
    }

    /// Remove and return the first buffered item accepted by `predicate`,
    /// without waiting.
    pub fn try_take(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        let mut inner = self.inner.lock();
        let pos = inner.items.iter().position(|item| predicate(item))?;
        inner.items.remove(pos)
    }

    /// Await the next item accepted by `predicate`.
    ///
    /// `timeout: None` waits indefinitely. With a timeout, elapsing completes
    /// with `Ok(None)` and deregisters the consumer; an item handed over in
    /// the same instant still wins.
    pub async fn wait_for<P>(
        &self,
        predicate: P,
        timeout: Option<Duration>,
    ) -> Result<Option<T>, QueueError>
    where
        P: Fn(&T) -> bool + Send + 'static,
    {
        let (consumer_id, mut receiver) = {
            let mut inner = self.inner.lock();
            if let Some(pos) = inner.items.iter().position(|item| predicate(item)) {
                return Ok(inner.items.remove(pos));
            }
            match &inner.shutdown {
                Shutdown::Closed => return Ok(None),
                Shutdown::Errored(error) => return Err(error.clone()),
                Shutdown::Open => {}
            }
            let id = inner.next_consumer_id;
            inner.next_consumer_id += 1;
            let (tx, rx) = oneshot::channel();
            inner.consumers.push_back(Consumer {
                id,
                predicate: Box::new(predicate),
                completion: tx,
            });
            (id, rx)
        };

        match timeout {
            None => receiver.await.unwrap_or(Ok(None)),
            Some(duration) => match tokio::time::timeout(duration, &mut receiver).await {
                Ok(result) => result.unwrap_or(Ok(None)),
                Err(_elapsed) => {
                    self.inner.lock().consumers.retain(|c| c.id != consumer_id);
                    // An item may have been handed over concurrently with the
                    // deadline; deliver it rather than dropping it.
                    match receiver.try_recv() {
                        Ok(result) => result,
                        Err(_) => Ok(None),
                    }
                }
            },
        }
    }

    /// Drop all items and consumers.
    ///
    /// With an error, every pending consumer completes with that error and
    /// later waits fail fast until the next push.
    pub fn flush(&self, error: Option<QueueError>) {
        let consumers = {
            let mut inner = self.inner.lock();
            inner.items.clear();
            if let Some(error) = &error {
                inner.shutdown = Shutdown::Errored(error.clone());
            }
            std::mem::take(&mut inner.consumers)
        };
        for consumer in consumers {
            let result = match &error {
                Some(error) => Err(error.clone()),
                None => Ok(None),
            };
            let _ = consumer.completion.send(result);
        }
    }

    /// End the stream: pending consumers complete empty, buffered items stay
    /// deliverable, and waits on an empty buffer return empty immediately.
    pub fn close(&self) {
        let consumers = {
            let mut inner = self.inner.lock();
            inner.shutdown = Shutdown::Closed;
            std::mem::take(&mut inner.consumers)
        };
        for consumer in consumers {
            let _ = consumer.completion.send(Ok(None));
        }
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the item buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}

impl<T: Clone + Send + 'static> AsyncQueue<T> {
    /// Copy of the buffered items, front to back (serialization support).
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().items.iter().cloned().collect()
    }
}
