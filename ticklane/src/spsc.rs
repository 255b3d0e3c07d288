//! Core SPSC (Single-Producer Single-Consumer) queue primitives.
//!
//! This module contains the ring buffer algorithm behind
//! [`crate::sync::spsc`]. It is unsafe to drive directly; the channel
//! handles are the supported entry point.

pub(crate) mod ring;
