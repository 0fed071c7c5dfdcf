//! The TCP engine.
//!
//! [`Connection`] is the per-flow state machine, [`Speaker`] drives a table
//! of them the way a packet pipeline would: it demultiplexes inbound
//! segments, fans out timer ticks and reclaims closed connections.

use std::{fmt, net::SocketAddr};

pub mod clock;
pub mod reassembly;
pub mod send_buffer;
pub mod sender;
pub mod seq;
pub mod stats;

mod connection;
mod speaker;

pub use clock::TcpClock;
pub use connection::{
    Config, ConnFlags, Connection, ConnectionSummary, Direction, SocketFlags, State, TcpContext,
    TimerKind, TCPTV_KEEP_INIT, TCPTV_MSL, TCPTV_PERSMAX, TCPTV_PERSMIN, TCPTV_REXMTMAX,
    TCP_MAXRXTSHIFT, TCP_PAWS_IDLE,
};
pub use speaker::Speaker;
pub use stats::{Counter, TcpStats, TcpStatsSnapshot};

#[cfg(test)]
mod tests;

/// Identifies a flow, seen from the local end.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Quad {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl Quad {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self { src, dst }
    }

    /// The same flow seen from the peer.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.src.is_ipv4() && self.dst.is_ipv4()
    }
}

impl fmt::Display for Quad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}
