//! Wait-free single-producer single-consumer ring buffer
//!
//! The buffer circulation protocol moves `Box<SampleBuffer>` handles between
//! the capture thread, the playback thread and (while streams are idle) the
//! control thread. Every directed edge gets its own ring, and every ring is
//! split into a [`Producer`] and a [`Consumer`] so the single-writer rule is
//! enforced by ownership rather than by convention.
//!
//! # Memory ordering
//!
//! - `push`: acquire-load of the read cursor, relaxed-load of the write cursor
//!   (only the producer writes it), element write, release-store of the write cursor.
//! - `pop`/`front`: acquire-load of the write cursor, relaxed-load of the read
//!   cursor, element read, and for `pop` a release-store of the read cursor.
//!
//! The release/acquire pair on each cursor is the only synchronization the
//! element slots need.
//!
//! # Cursor arithmetic
//!
//! Cursors advance monotonically and wrap at twice the capacity. Keeping them
//! in `[0, 2N)` lets `write == read` mean empty and `distance == N` mean full
//! without a spare slot, and no cursor can ever overflow `usize`.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

/// Marker that keeps an endpoint `Send` but not `Sync`
type NotSync = PhantomData<Cell<()>>;

/// Shared storage behind a producer/consumer pair
pub struct RingBuffer<T> {
    /// Read cursor, written only by the consumer
    head: CachePadded<AtomicUsize>,
    /// Write cursor, written only by the producer
    tail: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: usize,
}

// SAFETY: a slot is touched by the producer only while it lies outside
// [head, tail), and by the consumer only while it lies inside. The cursor
// release/acquire pairs hand each slot over exactly once per lap. Each side
// is reachable from a single thread only because the endpoints are !Sync.
unsafe impl<T: Send> Sync for RingBuffer<T> {}
unsafe impl<T: Send> Send for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Create a ring holding at most `capacity` items and split it into its two endpoints
    ///
    /// # Panics
    /// Panics if `capacity` is zero or too large for the doubled cursor range.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity: usize) -> (Producer<T>, Consumer<T>) {
        assert!(capacity > 0, "ring capacity must be non-zero");
        assert!(
            capacity <= usize::MAX / 2,
            "ring capacity {} leaves no room for cursor wrap",
            capacity
        );

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let ring = Arc::new(Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots,
            capacity,
        });

        (
            Producer {
                ring: Arc::clone(&ring),
                _not_sync: PhantomData,
            },
            Consumer {
                ring,
                _not_sync: PhantomData,
            },
        )
    }

    /// Maximum number of items the ring can hold
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items between two cursors
    #[inline]
    fn distance(&self, read: usize, write: usize) -> usize {
        if read <= write {
            write - read
        } else {
            2 * self.capacity - read + write
        }
    }

    #[inline]
    fn advance(&self, cursor: usize) -> usize {
        if cursor < 2 * self.capacity - 1 {
            cursor + 1
        } else {
            0
        }
    }

    #[inline]
    fn slot(&self, cursor: usize) -> *mut MaybeUninit<T> {
        let index = if cursor < self.capacity {
            cursor
        } else {
            cursor - self.capacity
        };
        self.slots[index].get()
    }

    /// Occupancy as seen from a thread that owns neither endpoint
    #[inline]
    fn observed_len(&self) -> usize {
        let read = self.head.load(Ordering::Acquire);
        let write = self.tail.load(Ordering::Acquire);
        self.distance(read, write).min(self.capacity)
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        let mut read = *self.head.get_mut();
        let write = *self.tail.get_mut();
        while read != write {
            // SAFETY: both endpoints are gone; slots in [read, write) are initialised.
            unsafe { (*self.slot(read)).assume_init_drop() };
            read = self.advance(read);
        }
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.observed_len())
            .finish()
    }
}

/// Writing endpoint of a [`RingBuffer`]
///
/// Exactly one thread may own this at a time: it is `Send` but neither
/// `Clone` nor `Sync`.
///
/// ```compile_fail
/// fn assert_sync<S: Sync>() {}
/// assert_sync::<echo_core::ring::Producer<u32>>();
/// ```
pub struct Producer<T> {
    ring: Arc<RingBuffer<T>>,
    _not_sync: NotSync,
}

impl<T> Producer<T> {
    /// Append an item
    ///
    /// Returns the item back in `Err` when the ring is full; the ring is left
    /// untouched in that case. Never blocks, never allocates.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        let ring = &*self.ring;
        let read = ring.head.load(Ordering::Acquire);
        let write = ring.tail.load(Ordering::Relaxed);

        if ring.capacity - ring.distance(read, write) < 1 {
            return Err(item);
        }

        // SAFETY: the slot at `write` is outside [read, write) so the consumer
        // cannot be looking at it until the release-store below publishes it.
        unsafe { (*ring.slot(write)).write(item) };
        ring.tail.store(ring.advance(write), Ordering::Release);
        Ok(())
    }

    /// Number of queued items (exact lower bound of free space from this side)
    pub fn len(&self) -> usize {
        let ring = &*self.ring;
        let read = ring.head.load(Ordering::Acquire);
        let write = ring.tail.load(Ordering::Relaxed);
        ring.distance(read, write)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free slots; a push is guaranteed to succeed while this is non-zero
    pub fn slots(&self) -> usize {
        self.ring.capacity - self.len()
    }

    pub fn is_full(&self) -> bool {
        self.slots() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /// Read-only occupancy probe for diagnostics on a third thread
    pub fn probe(&self) -> RingProbe<T> {
        RingProbe {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &self.ring.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Reading endpoint of a [`RingBuffer`]
///
/// `Send` but not `Sync`, so `front` can never hand out the same slot to
/// two threads.
///
/// ```compile_fail
/// use std::cell::Cell;
/// fn assert_sync<S: Sync>() {}
/// assert_sync::<echo_core::ring::Consumer<Cell<u32>>>();
/// ```
pub struct Consumer<T> {
    ring: Arc<RingBuffer<T>>,
    _not_sync: NotSync,
}

impl<T> Consumer<T> {
    /// Remove and return the oldest item, or `None` when empty
    pub fn pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let write = ring.tail.load(Ordering::Acquire);
        let read = ring.head.load(Ordering::Relaxed);

        if ring.distance(read, write) < 1 {
            return None;
        }

        // SAFETY: the slot at `read` was published by the producer's release-store
        // and stays ours until the release-store below hands it back.
        let item = unsafe { (*ring.slot(read)).assume_init_read() };
        ring.head.store(ring.advance(read), Ordering::Release);
        Some(item)
    }

    /// Look at the oldest item without removing it
    pub fn front(&self) -> Option<&T> {
        let ring = &*self.ring;
        let write = ring.tail.load(Ordering::Acquire);
        let read = ring.head.load(Ordering::Relaxed);

        if ring.distance(read, write) < 1 {
            return None;
        }

        // SAFETY: as in `pop`; the producer never writes an occupied slot, the
        // shared borrow of `self` rules out a concurrent `pop`, and `Consumer`
        // is !Sync so that borrow cannot be on another thread.
        Some(unsafe { (*ring.slot(read)).assume_init_ref() })
    }

    /// Mutable access to the oldest item without removing it
    pub fn front_mut(&mut self) -> Option<&mut T> {
        let ring = &*self.ring;
        let write = ring.tail.load(Ordering::Acquire);
        let read = ring.head.load(Ordering::Relaxed);

        if ring.distance(read, write) < 1 {
            return None;
        }

        // SAFETY: see `front`; the exclusive borrow makes the reference unique.
        Some(unsafe { (*ring.slot(read)).assume_init_mut() })
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        let ring = &*self.ring;
        let write = ring.tail.load(Ordering::Acquire);
        let read = ring.head.load(Ordering::Relaxed);
        ring.distance(read, write)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    pub fn probe(&self) -> RingProbe<T> {
        RingProbe {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &self.ring.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Occupancy probe that can live on any thread
///
/// Cannot touch elements. The value is a snapshot and may be stale by the
/// time it is read if both endpoints are active.
pub struct RingProbe<T> {
    ring: Arc<RingBuffer<T>>,
}

impl<T> RingProbe<T> {
    pub fn len(&self) -> usize {
        self.ring.observed_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }
}

impl<T> Clone for RingProbe<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T> fmt::Debug for RingProbe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.ring.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_push_until_full_then_pop_frees_a_slot() {
        let (mut tx, mut rx) = RingBuffer::new(4);
        for item in ['A', 'B', 'C', 'D'] {
            assert!(tx.push(item).is_ok());
        }
        assert_eq!(tx.push('E'), Err('E'));
        assert_eq!(rx.len(), 4);

        assert_eq!(rx.pop(), Some('A'));
        assert!(tx.push('E').is_ok());

        let drained: Vec<_> = std::iter::from_fn(|| rx.pop()).collect();
        assert_eq!(drained, vec!['B', 'C', 'D', 'E']);
    }

    #[test]
    fn test_empty_ring() {
        let (tx, mut rx) = RingBuffer::<u32>::new(3);
        assert!(rx.is_empty());
        assert!(tx.is_empty());
        assert_eq!(tx.slots(), 3);
        assert_eq!(rx.pop(), None);
        assert_eq!(rx.front(), None);
    }

    #[test]
    fn test_front_does_not_consume() {
        let (mut tx, mut rx) = RingBuffer::new(2);
        tx.push(7).unwrap();
        assert_eq!(rx.front(), Some(&7));
        assert_eq!(rx.front(), Some(&7));
        assert_eq!(rx.len(), 1);

        if let Some(value) = rx.front_mut() {
            *value = 9;
        }
        assert_eq!(rx.pop(), Some(9));
        assert!(rx.is_empty());
    }

    #[test]
    fn test_cursor_wrap_keeps_fifo_order() {
        // Capacity 3 is not a power of two, so the wrap at 2N is exercised
        // at a different phase than the slot index on every lap.
        let (mut tx, mut rx) = RingBuffer::new(3);
        let mut next_in = 0u32;
        let mut next_out = 0u32;
        for round in 0..1000 {
            let burst = round % 4;
            for _ in 0..burst {
                if tx.push(next_in).is_ok() {
                    next_in += 1;
                }
            }
            while let Some(value) = rx.pop() {
                assert_eq!(value, next_out);
                next_out += 1;
            }
        }
        assert_eq!(next_in, next_out);
        assert!(next_in > 1000);
    }

    #[test]
    fn test_len_stays_within_capacity() {
        let (mut tx, mut rx) = RingBuffer::new(5);
        for i in 0..37 {
            let _ = tx.push(i);
            assert!(tx.len() <= 5);
            assert!(rx.len() <= 5);
            if i % 3 == 0 {
                rx.pop();
            }
        }
        assert_eq!(tx.probe().len(), rx.len());
    }

    #[test]
    fn test_remaining_items_dropped_with_ring() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let (mut tx, mut rx) = RingBuffer::new(4);
            for _ in 0..3 {
                assert!(tx.push(Counted(Arc::clone(&drops))).is_ok());
            }
            drop(rx.pop());
            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_spsc_threads_preserve_order() {
        const COUNT: u64 = 200_000;
        let (mut tx, mut rx) = RingBuffer::new(16);

        thread::scope(|s| {
            s.spawn(move || {
                let mut next = 0u64;
                while next < COUNT {
                    match tx.push(next) {
                        Ok(()) => next += 1,
                        Err(_) => std::hint::spin_loop(),
                    }
                }
            });

            s.spawn(move || {
                let mut expected = 0u64;
                while expected < COUNT {
                    match rx.pop() {
                        Some(value) => {
                            assert_eq!(value, expected);
                            expected += 1;
                        }
                        None => std::hint::spin_loop(),
                    }
                }
                assert!(rx.is_empty());
            });
        });
    }

    #[test]
    fn test_endpoints_are_send() {
        fn assert_send<S: Send>() {}
        assert_send::<Producer<Box<u32>>>();
        assert_send::<Consumer<Box<u32>>>();
        assert_send::<Consumer<std::cell::Cell<u32>>>();
        assert_send::<RingProbe<Box<u32>>>();

        // Moving the consumer to another thread still works
        let (mut tx, rx) = RingBuffer::new(2);
        tx.push(std::cell::Cell::new(3u32)).unwrap();
        let seen = thread::spawn(move || {
            let mut rx = rx;
            if let Some(cell) = rx.front() {
                cell.set(cell.get() + 1);
            }
            rx.pop().map(|cell| cell.get())
        })
        .join()
        .unwrap();
        assert_eq!(seen, Some(4));
    }

    #[test]
    fn test_boxed_items_move_without_copy() {
        let (mut tx, mut rx) = RingBuffer::new(2);
        let boxed = Box::new([1u8; 64]);
        let addr = boxed.as_ptr();
        tx.push(boxed).unwrap();
        let back = rx.pop().unwrap();
        assert_eq!(back.as_ptr(), addr);
    }
}
