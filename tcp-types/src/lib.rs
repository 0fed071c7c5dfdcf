//! Wire representation of TCP segments.

pub mod tcp;
