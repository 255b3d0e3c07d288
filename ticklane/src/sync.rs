//! Synchronization primitives for in-process communication.
//!
//! This module provides the bounded SPSC channel and the caller-side
//! polling helpers built on top of it.

pub mod poll;
pub mod spsc;
