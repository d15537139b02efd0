//! A fixed set of preallocated buffers cycling between two threads.
//!
//! The [`Pool`] half lives on the thread filling buffers (e.g. a network
//! receiver), the [`Recycle`] half on the thread draining them (e.g. audio
//! playout). Buffers are allocated once, up front, and never again: when the
//! pool runs dry, the filling side must drop its input instead of allocating.

/// Creates a pool initially holding every item of `items`.
pub fn recycler<T>(items: impl IntoIterator<Item = T>) -> (Pool<T>, Recycle<T>) {
    let items: Vec<T> = items.into_iter().collect();

    // `RingBuffer::new` doesn't accept 0
    let (mut tx, rx) = rtrb::RingBuffer::new(items.len().max(1));

    for item in items {
        // capacity was sized for every item
        let _ = tx.push(item);
    }

    (Pool { rx }, Recycle { tx })
}

/// The acquiring half of a [`recycler`].
#[derive(Debug)]
pub struct Pool<T> {
    rx: rtrb::Consumer<T>,
}

impl<T> Pool<T> {
    /// Takes a free buffer out of the pool, if any.
    #[inline(always)]
    pub fn acquire(&mut self) -> Option<T> {
        self.rx.pop().ok()
    }

    /// Number of free buffers.
    #[inline(always)]
    pub fn available(&self) -> usize {
        self.rx.slots()
    }
}

/// The returning half of a [`recycler`].
#[derive(Debug)]
pub struct Recycle<T> {
    tx: rtrb::Producer<T>,
}

impl<T> Recycle<T> {
    /// Returns a buffer to the pool.
    ///
    /// The pool can't hold more buffers than it was created with. Returning
    /// a buffer that didn't come from it hands it back in `Err`.
    #[inline(always)]
    pub fn give_back(&mut self, item: T) -> Result<(), T> {
        self.tx.push(item).map_err(|rtrb::PushError::Full(item)| item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_cycle() {
        let (mut pool, mut recycle) = recycler((0..3).map(|_| Vec::<i16>::with_capacity(16)));
        assert_eq!(pool.available(), 3);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let _c = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        recycle.give_back(a).unwrap();
        recycle.give_back(b).unwrap();
        assert_eq!(pool.available(), 2);

        let a = pool.acquire().unwrap();
        assert_eq!(a.capacity(), 16);
    }

    #[test]
    fn foreign_buffers_are_refused() {
        let (_pool, mut recycle) = recycler([1u8]);
        assert_eq!(recycle.give_back(2), Err(2));
    }
}
