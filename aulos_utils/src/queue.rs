//! A bounded single-producer single-consumer queue with timed waits.
//!
//! The queue sits between a network thread (producer) and a playout thread
//! (consumer). The producer never blocks: when the queue is full the new item
//! is handed back so the caller can recycle it and count the drop, while the
//! items already queued are left untouched. The consumer may wait for the next
//! item with a timeout, parking its thread until the producer wakes it.
//!
//! Besides the item count, the queue tracks the total [`weight`](Weighted) of
//! its items, e.g. the number of audio frames queued.

use core::{num, time::Duration};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

/// Items whose cumulated size is tracked by the queue.
pub trait Weighted {
    fn weight(&self) -> usize;
}

#[derive(Debug, Default)]
struct Shared {
    weight: AtomicUsize,
    /// The consumer thread, once it has waited at least once.
    waiter: parking_lot::Mutex<Option<thread::Thread>>,
}

impl Shared {
    #[inline(always)]
    fn wake(&self) {
        if let Some(t) = self.waiter.lock().as_ref() {
            t.unpark();
        }
    }
}

/// Creates a queue holding at most `capacity` items.
pub fn bounded<T: Weighted>(capacity: num::NonZeroUsize) -> (Tx<T>, Rx<T>) {
    let (tx, rx) = rtrb::RingBuffer::new(capacity.get());
    let shared = Arc::new(Shared::default());

    (
        Tx {
            tx,
            shared: shared.clone(),
        },
        Rx { rx, shared },
    )
}

/// The producing half of a [`bounded`] queue.
#[derive(Debug)]
pub struct Tx<T> {
    tx: rtrb::Producer<T>,
    shared: Arc<Shared>,
}

impl<T: Weighted> Tx<T> {
    /// Pushes `item`, waking the consumer.
    ///
    /// Never blocks. If the queue is full, `item` is handed back.
    #[inline(always)]
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        let weight = item.weight();

        // counted before the item becomes visible, the consumer subtracts it on pop
        self.shared.weight.fetch_add(weight, Ordering::AcqRel);

        if let Err(rtrb::PushError::Full(item)) = self.tx.push(item) {
            self.shared.weight.fetch_sub(weight, Ordering::AcqRel);
            return Err(item);
        }

        self.shared.wake();

        Ok(())
    }

    /// Number of items currently queued.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.capacity() - self.tx.slots()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.tx.buffer().capacity()
    }

    /// Total weight of the items currently queued.
    #[inline(always)]
    pub fn queued_weight(&self) -> usize {
        self.shared.weight.load(Ordering::Acquire)
    }

    /// Returns `true` if the consumer has been dropped.
    #[inline(always)]
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_abandoned()
    }
}

/// The consuming half of a [`bounded`] queue.
#[derive(Debug)]
pub struct Rx<T> {
    rx: rtrb::Consumer<T>,
    shared: Arc<Shared>,
}

impl<T: Weighted> Rx<T> {
    #[inline(always)]
    pub fn try_pop(&mut self) -> Option<T> {
        let item = self.rx.pop().ok()?;
        self.shared.weight.fetch_sub(item.weight(), Ordering::AcqRel);
        Some(item)
    }

    /// Pops the next item, waiting at most `timeout` for one to arrive.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;

        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }

            // register before re-checking, so a push landing in between still unparks us
            *self.shared.waiter.lock() = Some(thread::current());

            if let Some(item) = self.try_pop() {
                return Some(item);
            }

            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }

            thread::park_timeout(deadline - now);
        }
    }

    /// Removes every queued item.
    #[inline(always)]
    pub fn flush(&mut self) -> impl Iterator<Item = T> + '_ {
        core::iter::from_fn(|| self.try_pop())
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.rx.slots()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Total weight of the items currently queued.
    #[inline(always)]
    pub fn queued_weight(&self) -> usize {
        self.shared.weight.load(Ordering::Acquire)
    }

    /// Returns `true` if the producer has been dropped.
    #[inline(always)]
    pub fn is_abandoned(&self) -> bool {
        self.rx.is_abandoned()
    }
}
