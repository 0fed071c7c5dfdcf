//! A user-space TCP protocol engine.
//!
//! The engine is a per-connection state machine in the 4.4BSD tradition:
//! segment input with header prediction, segment output, a slow/fast timer
//! pair, RTT estimation, congestion control and PAWS. The caller owns packet
//! I/O. Decoded segments go in through [`tcp::Speaker`] (or directly through
//! [`tcp::Connection`]), outbound segments and in-order payload come back out.

#[macro_use]
mod macros;

pub mod tcp;
pub use tcp_types as types;
