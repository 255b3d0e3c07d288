//! Caller-side busy-polling over the SPSC channel.
//!
//! The channel never waits. These helpers are plain retry loops over
//! [`Producer::try_send`] and [`Consumer::try_receive`] with a pause hint
//! between attempts and an optional deadline, for callers that would rather
//! spin than write the loop themselves.
//!
//! ```
//! use std::time::Duration;
//! use ticklane::sync::poll::{Timeout, receive_spinning, send_spinning};
//! use ticklane::sync::spsc;
//!
//! let (tx, rx) = spsc::channel::<u32, 4>()?;
//! send_spinning(&tx, 1, Timeout::Infinite).unwrap();
//! assert_eq!(receive_spinning(&rx, Duration::from_millis(1).into()), Some(1));
//! assert_eq!(receive_spinning(&rx, Duration::from_millis(1).into()), None);
//! # Ok::<(), spsc::ChannelError>(())
//! ```

use std::time::Duration;

use minstant::Instant;

use super::spsc::{Consumer, Producer};

/// Timeout specification for spinning operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

impl Timeout {
    fn deadline(self) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::Duration(d) => Some(Instant::now() + d),
        }
    }
}

/// Spins until the item is accepted or the timeout expires.
///
/// # Errors
///
/// Returns `Err(item)` on timeout.
#[inline]
pub fn send_spinning<T: Send, const N: usize>(
    producer: &Producer<T, N>,
    mut item: T,
    timeout: Timeout,
) -> Result<(), T> {
    let deadline = timeout.deadline();
    loop {
        match producer.try_send(item) {
            Ok(()) => return Ok(()),
            Err(returned) => {
                item = returned;
                if let Some(dl) = deadline
                    && Instant::now() > dl
                {
                    return Err(item);
                }
                std::hint::spin_loop();
            }
        }
    }
}

/// Spins until an item arrives or the timeout expires.
///
/// Returns `None` on timeout.
#[inline]
#[must_use]
pub fn receive_spinning<T: Send, const N: usize>(
    consumer: &Consumer<T, N>,
    timeout: Timeout,
) -> Option<T> {
    let deadline = timeout.deadline();
    loop {
        if let Some(item) = consumer.try_receive() {
            return Some(item);
        }
        if let Some(dl) = deadline
            && Instant::now() > dl
        {
            return None;
        }
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::spsc::channel;

    #[test]
    fn send_times_out_on_full_channel() {
        let (producer, _consumer) = channel::<u64, 2>().unwrap();
        producer.try_send(1).unwrap();

        let started = Instant::now();
        let result = send_spinning(&producer, 2, Duration::from_millis(5).into());
        assert_eq!(result, Err(2));
        assert!(started.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn receive_times_out_on_empty_channel() {
        let (_producer, consumer) = channel::<u64, 2>().unwrap();
        assert_eq!(
            receive_spinning(&consumer, Duration::from_millis(2).into()),
            None
        );
    }

    #[test]
    fn receive_returns_immediately_when_ready() {
        let (producer, consumer) = channel::<u64, 4>().unwrap();
        producer.try_send(9).unwrap();
        assert_eq!(receive_spinning(&consumer, Timeout::Infinite), Some(9));
    }

    #[test]
    fn spinning_pair_moves_every_item() {
        let (producer, consumer) = channel::<u32, 8>().unwrap();
        let count = 5_000u32;

        let sender = std::thread::spawn(move || {
            for i in 0..count {
                send_spinning(&producer, i, Timeout::Infinite).unwrap();
            }
        });

        for expected in 0..count {
            assert_eq!(
                receive_spinning(&consumer, Timeout::Infinite),
                Some(expected)
            );
        }
        sender.join().unwrap();
    }
}
