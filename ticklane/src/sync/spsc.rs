//! Lock-free bounded SPSC channel for in-process (inter-thread) communication.
//!
//! A wait-free bounded queue over a single heap allocation with two atomic
//! cursors.
//!
//! # Overview
//!
//! - [`Producer`] - Write end (exactly one per channel)
//! - [`Consumer`] - Read end (exactly one per channel)
//! - Lock-free, wait-free: no mutexes, no syscalls, no allocation in the hot path
//! - Capacity `N` is a compile-time power of two; `N - 1` items fit at once
//!
//! # Example
//!
//! ```
//! use ticklane::sync::spsc;
//!
//! let (producer, consumer) = spsc::channel::<u64, 1024>()?;
//!
//! // Producer thread
//! producer.try_send(42).expect("channel full");
//!
//! // Consumer thread
//! assert_eq!(consumer.try_receive(), Some(42));
//! # Ok::<(), spsc::ChannelError>(())
//! ```
//!
//! # Single producer, single consumer
//!
//! The handles are the capability to act as a role. Neither is `Clone`, and
//! neither is `Sync`, so a role can move between threads but can never be
//! exercised from two threads at once:
//!
//! ```compile_fail
//! use ticklane::sync::spsc;
//!
//! let (producer, _consumer) = spsc::channel::<u64, 8>().unwrap();
//! let second = producer.clone();
//! ```
//!
//! ```compile_fail
//! use ticklane::sync::spsc;
//!
//! let (producer, _consumer) = spsc::channel::<u64, 8>().unwrap();
//! std::thread::scope(|s| {
//!     s.spawn(|| producer.try_send(1));
//!     s.spawn(|| producer.try_send(2));
//! });
//! ```
//!
//! Capacities that are not a power of two are rejected at compile time:
//!
//! ```compile_fail
//! use ticklane::sync::spsc;
//!
//! let _ = spsc::channel::<u64, 1000>();
//! ```

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use thiserror::Error;

use crate::spsc::ring::{CACHE_LINE, ConsumerState, ProducerState, Ring};
use crate::trace::debug;

/// Error creating a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The allocator could not provide storage for the ring.
    #[error("failed to allocate {bytes} bytes for channel storage")]
    Allocation {
        /// Size of the requested allocation.
        bytes: usize,
    },
}

/// Heap block shared by the two handles.
///
/// `handles` sits after the buffer; it is only touched when a handle drops.
#[repr(C)]
struct Shared<T, const N: usize> {
    ring: Ring<T, N>,
    handles: AtomicUsize,
}

impl<T, const N: usize> Shared<T, N> {
    /// Allocates and initializes the ring in place, with two handle references.
    ///
    /// The block is built directly on the heap so large capacities never pass
    /// through the stack.
    fn allocate() -> Result<NonNull<Self>, ChannelError> {
        let layout = Layout::new::<Self>();

        // SAFETY: `Self` always has non-zero size (it contains atomics).
        let raw = unsafe { alloc::alloc(layout) }.cast::<Self>();
        let Some(block) = NonNull::new(raw) else {
            return Err(ChannelError::Allocation {
                bytes: layout.size(),
            });
        };

        let ptr = block.as_ptr();
        // SAFETY: `ptr` is a fresh, exclusive, correctly aligned allocation.
        // Slots are MaybeUninit and are left uninitialized.
        unsafe {
            ptr::addr_of_mut!((*ptr).ring.producer).write(ProducerState::new());
            ptr::addr_of_mut!((*ptr).ring.consumer).write(ConsumerState::new());
            ptr::addr_of_mut!((*ptr).ring._padding).write([0; CACHE_LINE]);
            ptr::addr_of_mut!((*ptr).handles).write(AtomicUsize::new(2));
        }

        debug!(
            capacity = Ring::<T, N>::USABLE,
            bytes = layout.size(),
            "spsc channel allocated"
        );

        Ok(block)
    }

    /// Drops one handle's reference, tearing the block down on the last one.
    ///
    /// # Safety
    ///
    /// Each handle must call this exactly once, and must not touch the block
    /// afterwards.
    unsafe fn release(block: NonNull<Self>) {
        // SAFETY: the caller still holds a reference, so the block is alive.
        let handles = unsafe { &block.as_ref().handles };
        if handles.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        // Synchronizes with the other handle's release decrement, so all of
        // its slot writes and cursor stores are visible to the teardown.
        fence(Ordering::Acquire);

        let ptr = block.as_ptr();
        // SAFETY: we are the last reference; nobody else can observe the block.
        unsafe {
            let live = (*ptr).ring.len_exclusive();
            if live > 0 {
                debug!(live, "spsc channel dropped with undelivered items");
            }
            ptr::drop_in_place(ptr);
            alloc::dealloc(ptr.cast::<u8>(), Layout::new::<Self>());
        }
    }
}

/// Creates a new SPSC channel with compile-time capacity `N`.
///
/// Returns a `(Producer, Consumer)` pair. The producer and consumer can be
/// sent to different threads. At most `N - 1` items are in flight at once.
///
/// # Errors
///
/// Returns [`ChannelError::Allocation`] if the ring storage cannot be
/// allocated. This is the only point where the channel can fail.
///
/// # Panics
///
/// Fails to compile if `N` is not a power of two or `N < 2`.
///
/// # Example
///
/// ```
/// use ticklane::sync::spsc;
///
/// let (tx, rx) = spsc::channel::<String, 16>()?;
///
/// tx.try_send("hello".to_string()).unwrap();
/// assert_eq!(rx.try_receive(), Some("hello".to_string()));
/// # Ok::<(), spsc::ChannelError>(())
/// ```
pub fn channel<T: Send, const N: usize>() -> Result<(Producer<T, N>, Consumer<T, N>), ChannelError> {
    let () = Ring::<T, N>::CAPACITY_OK;

    let shared = Shared::<T, N>::allocate()?;

    let producer = Producer {
        shared,
        _owns: PhantomData,
    };

    let consumer = Consumer {
        shared,
        _owns: PhantomData,
    };

    Ok((producer, consumer))
}

/// Write end of the SPSC channel.
///
/// # Thread Safety
///
/// `Producer` is [`Send`] but **not** [`Sync`] and not `Clone`:
/// - Can transfer ownership to another thread
/// - Cannot share `&Producer` (no concurrent `try_send()`)
pub struct Producer<T: Send, const N: usize> {
    shared: NonNull<Shared<T, N>>,
    _owns: PhantomData<T>,
}

/// Read end of the SPSC channel.
///
/// See [`Producer`] for thread safety details (same semantics apply).
pub struct Consumer<T: Send, const N: usize> {
    shared: NonNull<Shared<T, N>>,
    _owns: PhantomData<T>,
}

// SAFETY: A handle only exercises its own role, and that role moves with it.
// NonNull keeps both handles !Sync.
unsafe impl<T: Send, const N: usize> Send for Producer<T, N> {}
unsafe impl<T: Send, const N: usize> Send for Consumer<T, N> {}

impl<T: Send, const N: usize> Producer<T, N> {
    /// Maximum number of items in flight (`N - 1`).
    pub const CAPACITY: usize = Ring::<T, N>::USABLE;

    #[inline]
    fn ring(&self) -> &Ring<T, N> {
        // SAFETY: the block outlives both handles.
        unsafe { &self.shared.as_ref().ring }
    }

    /// Attempts to send an item (wait-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the channel is full. Nothing else changes, so
    /// the caller can retry with the same item.
    #[inline]
    pub fn try_send(&self, item: T) -> Result<(), T> {
        // SAFETY: this handle is the only producer and is !Sync.
        unsafe { self.ring().try_push(item) }
    }

    /// Maximum number of items in flight (`N - 1`).
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        Self::CAPACITY
    }
}

impl<T: Send, const N: usize> Consumer<T, N> {
    /// Maximum number of items in flight (`N - 1`).
    pub const CAPACITY: usize = Ring::<T, N>::USABLE;

    #[inline]
    fn ring(&self) -> &Ring<T, N> {
        // SAFETY: the block outlives both handles.
        unsafe { &self.shared.as_ref().ring }
    }

    /// Attempts to receive the oldest item (wait-free).
    ///
    /// Returns `None` if the channel is empty.
    #[inline]
    #[must_use]
    pub fn try_receive(&self) -> Option<T> {
        // SAFETY: this handle is the only consumer and is !Sync.
        unsafe { self.ring().try_pop() }
    }

    /// Warms the cache line of the slot after the current read position.
    ///
    /// Advisory only; has no effect on what [`try_receive`](Self::try_receive)
    /// returns.
    #[inline]
    pub fn prefetch_hint(&self) {
        self.ring().prefetch_next();
    }

    /// Maximum number of items in flight (`N - 1`).
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        Self::CAPACITY
    }
}

impl<T: Send, const N: usize> Drop for Producer<T, N> {
    fn drop(&mut self) {
        // SAFETY: called once per handle, from its Drop.
        unsafe { Shared::release(self.shared) }
    }
}

impl<T: Send, const N: usize> Drop for Consumer<T, N> {
    fn drop(&mut self) {
        // SAFETY: called once per handle, from its Drop.
        unsafe { Shared::release(self.shared) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_basic_send_receive() {
        let (producer, consumer) = channel::<u64, 8>().unwrap();

        assert!(producer.try_send(42).is_ok());
        assert_eq!(consumer.try_receive(), Some(42));
        assert_eq!(consumer.try_receive(), None);
    }

    #[test]
    fn test_fresh_channel_is_empty() {
        let (_producer, consumer) = channel::<u64, 16>().unwrap();
        assert_eq!(consumer.try_receive(), None);
    }

    #[test]
    fn test_multiple_items() {
        let (producer, consumer) = channel::<u64, 16>().unwrap();

        for i in 0..10 {
            assert!(producer.try_send(i).is_ok());
        }

        for i in 0..10 {
            assert_eq!(consumer.try_receive(), Some(i));
        }

        assert_eq!(consumer.try_receive(), None);
    }

    #[test]
    fn test_channel_full_at_n_minus_one() {
        let (producer, consumer) = channel::<u64, 4>().unwrap();
        assert_eq!(producer.capacity(), 3);
        assert_eq!(consumer.capacity(), 3);

        for i in 0..3 {
            assert!(producer.try_send(i).is_ok(), "Failed to send item {i}");
        }

        assert_eq!(producer.try_send(999), Err(999));

        assert_eq!(consumer.try_receive(), Some(0));
        assert!(producer.try_send(3).is_ok());
        assert_eq!(producer.try_send(1000), Err(1000));

        for expected in 1..4 {
            assert_eq!(consumer.try_receive(), Some(expected));
        }
        assert_eq!(consumer.try_receive(), None);
    }

    #[test]
    fn test_smallest_capacity() {
        let (producer, consumer) = channel::<u8, 2>().unwrap();

        for i in 0..10 {
            assert!(producer.try_send(i).is_ok());
            assert_eq!(producer.try_send(i), Err(i));
            assert_eq!(consumer.try_receive(), Some(i));
            assert_eq!(consumer.try_receive(), None);
        }
    }

    #[test]
    fn test_wrapping_behavior() {
        let (producer, consumer) = channel::<u64, 4>().unwrap();

        for round in 0..5 {
            for i in 0..3 {
                let value = round * 10 + i;
                assert!(producer.try_send(value).is_ok());
            }

            for i in 0..3 {
                let expected = round * 10 + i;
                assert_eq!(consumer.try_receive(), Some(expected));
            }

            assert_eq!(consumer.try_receive(), None);
        }
    }

    #[test]
    fn test_interleaved_operations() {
        let (producer, consumer) = channel::<u64, 8>().unwrap();

        producer.try_send(1).unwrap();
        producer.try_send(2).unwrap();
        assert_eq!(consumer.try_receive(), Some(1));
        producer.try_send(3).unwrap();
        assert_eq!(consumer.try_receive(), Some(2));
        assert_eq!(consumer.try_receive(), Some(3));
        producer.try_send(4).unwrap();
        producer.try_send(5).unwrap();
        assert_eq!(consumer.try_receive(), Some(4));
        assert_eq!(consumer.try_receive(), Some(5));
        assert_eq!(consumer.try_receive(), None);
    }

    #[test]
    fn test_prefetch_hint_does_not_disturb_order() {
        let (producer, consumer) = channel::<u64, 8>().unwrap();

        consumer.prefetch_hint();
        producer.try_send(7).unwrap();
        producer.try_send(8).unwrap();
        consumer.prefetch_hint();
        assert_eq!(consumer.try_receive(), Some(7));
        consumer.prefetch_hint();
        assert_eq!(consumer.try_receive(), Some(8));
    }

    #[test]
    fn test_send_to_thread() {
        let (producer, consumer) = channel::<u64, 16>().unwrap();

        let handle = std::thread::spawn(move || {
            for i in 0..10 {
                producer.try_send(i).unwrap();
            }
        });

        handle.join().unwrap();

        for i in 0..10 {
            assert_eq!(consumer.try_receive(), Some(i));
        }
    }

    #[test]
    fn test_concurrent_send_receive() {
        let (producer, consumer) = channel::<u64, 64>().unwrap();
        let count = 10_000u64;

        let producer_handle = std::thread::spawn(move || {
            for i in 0..count {
                while producer.try_send(i).is_err() {
                    std::hint::spin_loop();
                }
            }
        });

        let consumer_handle = std::thread::spawn(move || {
            let mut received = Vec::with_capacity(count as usize);
            while received.len() < count as usize {
                if let Some(item) = consumer.try_receive() {
                    received.push(item);
                } else {
                    std::hint::spin_loop();
                }
            }
            received
        });

        producer_handle.join().unwrap();
        let received = consumer_handle.join().unwrap();

        for (i, &val) in received.iter().enumerate() {
            assert_eq!(val, i as u64);
        }
    }

    #[test]
    fn test_non_copy_type() {
        let (producer, consumer) = channel::<String, 8>().unwrap();

        producer.try_send("hello".to_string()).unwrap();
        producer.try_send("world".to_string()).unwrap();

        assert_eq!(consumer.try_receive(), Some("hello".to_string()));
        assert_eq!(consumer.try_receive(), Some("world".to_string()));
        assert_eq!(consumer.try_receive(), None);
    }

    #[test]
    fn test_rejected_item_is_returned_intact() {
        let (producer, _consumer) = channel::<Vec<u8>, 2>().unwrap();

        producer.try_send(vec![1]).unwrap();
        let rejected = producer.try_send(vec![2, 3, 4]).unwrap_err();
        assert_eq!(rejected, vec![2, 3, 4]);
    }

    #[test]
    fn test_undelivered_items_dropped_with_last_handle() {
        let token = Arc::new(());
        let (producer, consumer) = channel::<Arc<()>, 8>().unwrap();

        for _ in 0..5 {
            producer.try_send(Arc::clone(&token)).unwrap();
        }
        let first = consumer.try_receive().unwrap();
        assert_eq!(Arc::strong_count(&token), 6);

        drop(producer);
        // Consumer still alive: items stay buffered.
        assert_eq!(Arc::strong_count(&token), 6);

        drop(consumer);
        assert_eq!(Arc::strong_count(&token), 2);

        drop(first);
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_consumer_drains_after_producer_gone() {
        let (producer, consumer) = channel::<u64, 8>().unwrap();
        for i in 0..4 {
            producer.try_send(i).unwrap();
        }
        drop(producer);

        for i in 0..4 {
            assert_eq!(consumer.try_receive(), Some(i));
        }
        assert_eq!(consumer.try_receive(), None);
    }

    #[test]
    fn test_large_capacity_is_heap_built() {
        // 1 << 20 u64 slots would not fit on a default test thread stack.
        let (producer, consumer) = channel::<u64, { 1 << 20 }>().unwrap();
        assert_eq!(producer.capacity(), (1 << 20) - 1);

        producer.try_send(1).unwrap();
        assert_eq!(consumer.try_receive(), Some(1));
    }
}
