//! Core lock-free SPSC ring buffer algorithm.
//!
//! Cursors are stored already masked into `[0, N)`. The producer publishes a
//! slot by release-storing the next write cursor; the consumer releases a slot
//! back by release-storing the next read cursor. Each side keeps a private
//! cached copy of the other side's cursor and only refreshes it (with an
//! acquire load) when the cached value says full/empty.
//!
//! One slot is always left unused so that `write == read` means empty and
//! `(write + 1) & MASK == read` means full. Usable capacity is `N - 1`.
//!
//! # Safety
//!
//! The types in this module have unsafe APIs because they require the caller to
//! uphold the SPSC invariant: exactly one producer and one consumer, with no
//! concurrent access to either role.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of the cache line the cursor states are aligned to.
pub const CACHE_LINE: usize = 64;

/// Role marker: Fields with this role are owned exclusively by the producer.
pub struct ProducerRole;

/// Role marker: Fields with this role are owned exclusively by the consumer.
pub struct ConsumerRole;

/// Role marker: Buffer slots whose ownership transfers via the SPSC protocol.
pub struct SlotRole;

/// Interior-mutable cell with a role marker for nominal type safety.
///
/// The `Role` doesn't affect runtime behavior. It makes the producer-private,
/// consumer-private and slot cells distinct types so one cannot be handed
/// where another is expected.
#[repr(transparent)]
pub struct SpscCell<T, Role>(UnsafeCell<T>, PhantomData<Role>);

impl<T, Role> SpscCell<T, Role> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value), PhantomData)
    }

    pub const fn get(&self) -> *mut T {
        self.0.get()
    }
}

// SAFETY: Every SpscCell is accessed by at most one side at a time. Private
// caches are only touched by their owning role; slots change hands through the
// release/acquire cursor protocol.
unsafe impl<T: Send, Role> Sync for SpscCell<T, Role> {}
unsafe impl<T: Send, Role> Send for SpscCell<T, Role> {}

/// Cache cell owned exclusively by the producer.
pub type ProducerCache<T> = SpscCell<T, ProducerRole>;

/// Cache cell owned exclusively by the consumer.
pub type ConsumerCache<T> = SpscCell<T, ConsumerRole>;

/// Buffer slot cell with ownership governed by the SPSC protocol.
pub type SlotCell<T> = SpscCell<T, SlotRole>;

/// Producer-side state. Must occupy a distinct cache line from
/// [`ConsumerState`].
#[repr(C)]
#[repr(align(64))]
pub struct ProducerState {
    /// Next slot to write, in `[0, N)`.
    /// Owned by producer, read by consumer.
    pub write: AtomicUsize,

    /// Last read cursor the producer observed.
    pub cached_read: ProducerCache<usize>,
}

impl ProducerState {
    pub const fn new() -> Self {
        Self {
            write: AtomicUsize::new(0),
            cached_read: ProducerCache::new(0),
        }
    }
}

impl Default for ProducerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer-side state. Must occupy a distinct cache line from
/// [`ProducerState`].
#[repr(C)]
#[repr(align(64))]
pub struct ConsumerState {
    /// Next slot to read, in `[0, N)`.
    /// Owned by consumer, read by producer.
    pub read: AtomicUsize,

    /// Last write cursor the consumer observed.
    pub cached_write: ConsumerCache<usize>,
}

impl ConsumerState {
    pub const fn new() -> Self {
        Self {
            read: AtomicUsize::new(0),
            cached_write: ConsumerCache::new(0),
        }
    }
}

impl Default for ConsumerState {
    fn default() -> Self {
        Self::new()
    }
}

/// A single slot in the ring buffer.
#[repr(C)]
pub struct Slot<T> {
    pub value: SlotCell<MaybeUninit<T>>,
}

/// Ring buffer state and storage.
///
/// ```text
/// ┌────────────────────────────────────────┐
/// │ ProducerState  (write, cached_read)    │  64-byte aligned
/// ├────────────────────────────────────────┤
/// │ ConsumerState  (read, cached_write)    │  64-byte aligned
/// ├────────────────────────────────────────┤
/// │ Padding        (false sharing guard)   │
/// ├────────────────────────────────────────┤
/// │ Buffer: [Slot<T>; N]                   │
/// └────────────────────────────────────────┘
/// ```
#[repr(C)]
pub struct Ring<T, const N: usize> {
    /// Producer state (write cursor + cached read).
    pub producer: ProducerState,

    /// Consumer state (read cursor + cached write).
    pub consumer: ConsumerState,

    /// Prevent false sharing between consumer state and buffer.
    pub _padding: [u8; CACHE_LINE],

    /// Ring buffer slots.
    pub buffer: [Slot<T>; N],
}

impl<T, const N: usize> Ring<T, N> {
    /// Bitmask replacing `% N`.
    pub const MASK: usize = N - 1;

    /// Compile-time check that `N` is a power of two and at least 2.
    pub const CAPACITY_OK: () = assert!(
        N >= 2 && N.is_power_of_two(),
        "ring capacity must be a power of two and at least 2"
    );

    /// Number of items the ring can hold at once.
    pub const USABLE: usize = N - 1;

    /// Advances a cursor by one slot, wrapping at `N`.
    #[inline]
    pub const fn bump(cursor: usize) -> usize {
        (cursor + 1) & Self::MASK
    }

    /// Attempts to push an item onto the ring.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - Only one thread calls this method (single producer)
    /// - The producer and consumer states have been initialized
    #[inline]
    pub unsafe fn try_push(&self, item: T) -> Result<(), T> {
        // Own cursor, nobody else stores to it.
        let write = self.producer.write.load(Ordering::Relaxed);
        let next = Self::bump(write);

        // SAFETY: Producer has exclusive access to cached_read
        let cached_read = unsafe { *self.producer.cached_read.get() };

        if next == cached_read {
            // Acquire pairs with the consumer's release of `read`: the slot
            // we are about to overwrite has been fully moved out.
            let read = self.consumer.read.load(Ordering::Acquire);
            // SAFETY: Producer has exclusive write access to its cached_read
            unsafe {
                *self.producer.cached_read.get() = read;
            }

            if next == read {
                return Err(item);
            }
        }

        // SAFETY: The producer owns the slot at `write` because:
        // - `write` hasn't been published yet (store happens after this write)
        // - `next != read`, so the slot is outside the live range [read, write)
        // - `write` is in [0, N) since it only ever comes from `bump`
        unsafe {
            let slot = self.buffer.get_unchecked(write).value.get();
            std::ptr::write(slot, MaybeUninit::new(item));
        }

        // Release makes the slot write visible before the new cursor.
        self.producer.write.store(next, Ordering::Release);

        Ok(())
    }

    /// Attempts to pop the oldest item from the ring.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - Only one thread calls this method (single consumer)
    /// - The producer and consumer states have been initialized
    #[inline]
    pub unsafe fn try_pop(&self) -> Option<T> {
        let read = self.consumer.read.load(Ordering::Relaxed);

        // SAFETY: Consumer has exclusive access to cached_write
        let cached_write = unsafe { *self.consumer.cached_write.get() };

        if read == cached_write {
            // Acquire pairs with the producer's release of `write`.
            let write = self.producer.write.load(Ordering::Acquire);
            // SAFETY: Consumer has exclusive write access to its cached_write
            unsafe {
                *self.consumer.cached_write.get() = write;
            }

            if read == write {
                return None;
            }
        }

        // SAFETY: The consumer owns the slot at `read` because:
        // - read != write as observed through an acquire load, so the producer
        //   constructed this slot before publishing
        // - the producer won't touch it again until we publish the new read
        // - `read` is in [0, N) since it only ever comes from `bump`
        let item = unsafe {
            let slot = self.buffer.get_unchecked(read).value.get();
            std::ptr::read(slot).assume_init()
        };

        // Release orders the move-out before the producer may reuse the slot.
        self.consumer.read.store(Self::bump(read), Ordering::Release);

        Some(item)
    }

    /// Hints the CPU to pull the slot after the current read cursor into L1.
    ///
    /// Purely advisory. Prefetching never faults and never reads the value,
    /// so calling this from any thread is harmless.
    #[inline]
    pub fn prefetch_next(&self) {
        let next = Self::bump(self.consumer.read.load(Ordering::Relaxed));
        prefetch_read(self.buffer[next].value.get().cast_const());
    }

    /// Number of live slots, given exclusive access.
    pub fn len_exclusive(&mut self) -> usize {
        let write = *self.producer.write.get_mut();
        let read = *self.consumer.read.get_mut();
        write.wrapping_sub(read) & Self::MASK
    }
}

impl<T, const N: usize> Drop for Ring<T, N> {
    fn drop(&mut self) {
        let write = *self.producer.write.get_mut();
        let mut read = *self.consumer.read.get_mut();

        while read != write {
            // SAFETY: `&mut self` means both roles are gone; every slot in
            // [read, write) was constructed and never moved out.
            unsafe {
                let slot = self.buffer.get_unchecked(read).value.get();
                (*slot).assume_init_drop();
            }
            read = Self::bump(read);
        }

        *self.consumer.read.get_mut() = write;
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn prefetch_read<U>(ptr: *const U) {
    use std::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
    // SAFETY: prefetch never dereferences; SSE is part of the x86_64 baseline.
    unsafe { _mm_prefetch::<{ _MM_HINT_T0 }>(ptr.cast::<i8>()) }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn prefetch_read<U>(_ptr: *const U) {}

// SAFETY: Ring is Send because all fields are Send (AtomicUsize, SpscCell).
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}

// SAFETY: Ring is Sync because concurrent access is mediated by atomics:
// - write/read are AtomicUsize with Release/Acquire ordering
// - Buffer slots are protected by the SPSC invariant (see SpscCell)
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}
