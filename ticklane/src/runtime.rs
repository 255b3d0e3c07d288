//! Thread placement for the producer and consumer sides.

pub mod topology;
