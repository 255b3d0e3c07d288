//! # ticklane
//!
//! Lock-free bounded SPSC channel for handing fixed-size items between
//! exactly one producer thread and one consumer thread, plus the vector
//! kernels and benchmark harness that sit around it.
//!
//! - [`sync::spsc`] - the channel: [`channel`](sync::spsc::channel),
//!   [`Producer::try_send`](sync::spsc::Producer::try_send),
//!   [`Consumer::try_receive`](sync::spsc::Consumer::try_receive)
//! - [`sync::poll`] - caller-side spin loops with optional deadlines
//! - [`kernel`] - `dot_product` / `elementwise_add` with scalar and AVX2 variants
//! - [`runtime::topology`] - producer/consumer core placement
//! - [`bench`] - throughput, round-trip and kernel benches
//!
//! ```
//! use ticklane::sync::spsc;
//!
//! let (tx, rx) = spsc::channel::<u64, 4096>()?;
//! let worker = std::thread::spawn(move || {
//!     for i in 0..100 {
//!         while tx.try_send(i).is_err() {
//!             std::hint::spin_loop();
//!         }
//!     }
//! });
//!
//! let mut next = 0;
//! while next < 100 {
//!     if let Some(value) = rx.try_receive() {
//!         assert_eq!(value, next);
//!         next += 1;
//!     }
//! }
//! worker.join().unwrap();
//! # Ok::<(), spsc::ChannelError>(())
//! ```

pub mod bench;
pub mod kernel;
pub mod runtime;
pub(crate) mod spsc;
pub mod sync;
pub mod trace;
